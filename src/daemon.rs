//! The daemon actor.
//!
//! All controller and exposure state is owned by one task that processes
//! [`DaemonCommand`]s from an mpsc channel. Quick queries are answered
//! inline; operations that hold the fleet for seconds or minutes (expose,
//! readout, flush, config upload, recovery) are spawned so the actor stays
//! responsive and an `abort` can always get through. The per-operation locks
//! inside the delegate and the controllers keep the spawned work serialised.

use std::sync::Arc;

use futures::future;
use serde_json::json;
use tokio::sync::mpsc;
use tracing::info;

use crate::controller::ControllerStatus;
use crate::core::Reporter;
use crate::error::{ArchonError, ArchonResult};
use crate::exposure::ExposureDelegate;
use crate::messages::{DaemonCommand, StatusReport};

/// Depth of the daemon command queue.
pub const COMMAND_QUEUE: usize = 32;

/// Owns the controller fleet and the exposure delegate.
pub struct ArchonDaemon {
    delegate: Arc<ExposureDelegate>,
    reporter: Reporter,
}

impl ArchonDaemon {
    pub fn new(delegate: Arc<ExposureDelegate>, reporter: Reporter) -> Self {
        Self { delegate, reporter }
    }

    pub fn delegate(&self) -> Arc<ExposureDelegate> {
        Arc::clone(&self.delegate)
    }

    /// Runs the actor loop until a `Shutdown` command arrives or the channel
    /// closes. Controllers are disconnected on the way out.
    pub async fn run(self, mut rx: mpsc::Receiver<DaemonCommand>) {
        info!("daemon actor started");

        while let Some(command) = rx.recv().await {
            match command {
                DaemonCommand::Expose { params, response } => {
                    let delegate = Arc::clone(&self.delegate);
                    tokio::spawn(async move {
                        let _ = response.send(delegate.expose(params).await);
                    });
                }

                DaemonCommand::Readout {
                    extra_header,
                    response,
                } => {
                    let delegate = Arc::clone(&self.delegate);
                    tokio::spawn(async move {
                        let _ = response.send(delegate.readout(extra_header).await);
                    });
                }

                DaemonCommand::Abort { response } => {
                    let _ = response.send(self.delegate.abort().await);
                }

                DaemonCommand::Flush {
                    count,
                    controllers,
                    response,
                } => {
                    let delegate = Arc::clone(&self.delegate);
                    tokio::spawn(async move {
                        let _ = response.send(Self::flush(&delegate, count, controllers).await);
                    });
                }

                DaemonCommand::GetStatus {
                    controller,
                    response,
                } => {
                    let _ = response.send(self.status_reports(controller.as_deref()).await);
                }

                DaemonCommand::GetSystem {
                    controller,
                    response,
                } => {
                    let _ = response.send(self.system(&controller).await);
                }

                DaemonCommand::GetFrame {
                    controller,
                    response,
                } => {
                    let _ = response.send(self.frame(&controller).await);
                }

                DaemonCommand::WriteConfig {
                    controller,
                    text,
                    overrides,
                    apply,
                    response,
                } => {
                    let delegate = Arc::clone(&self.delegate);
                    tokio::spawn(async move {
                        let result = match delegate.controller(&controller) {
                            Ok(device) => device.write_config(&text, &overrides, &apply).await,
                            Err(err) => Err(err),
                        };
                        let _ = response.send(result);
                    });
                }

                DaemonCommand::ReadConfig {
                    controller,
                    response,
                } => {
                    let delegate = Arc::clone(&self.delegate);
                    let reporter = self.reporter.clone();
                    tokio::spawn(async move {
                        let result = match delegate.controller(&controller) {
                            Ok(device) => match device.read_config().await {
                                Ok((_, text)) => {
                                    reporter.config(&controller, json!(text)).await;
                                    Ok(text)
                                }
                                Err(err) => Err(err),
                            },
                            Err(err) => Err(err),
                        };
                        let _ = response.send(result);
                    });
                }

                DaemonCommand::Talk {
                    controller,
                    text,
                    response,
                } => {
                    let _ = response.send(self.talk(&controller, &text).await);
                }

                DaemonCommand::Power {
                    controller,
                    on,
                    response,
                } => {
                    let _ = response.send(self.power(controller.as_deref(), on).await);
                }

                DaemonCommand::Reconnect {
                    controller,
                    response,
                } => {
                    let result = match self.delegate.controller(&controller) {
                        Ok(device) => device.reconnect().await,
                        Err(err) => Err(err),
                    };
                    let _ = response.send(result);
                }

                DaemonCommand::Recover { response } => {
                    let delegate = Arc::clone(&self.delegate);
                    tokio::spawn(async move {
                        let _ = response.send(delegate.recover().await);
                    });
                }

                DaemonCommand::Reset { response } => {
                    let delegate = Arc::clone(&self.delegate);
                    tokio::spawn(async move {
                        let _ = response.send(delegate.reset().await);
                    });
                }

                DaemonCommand::Shutdown { response } => {
                    info!("daemon actor shutting down");
                    for controller in self.delegate.controllers() {
                        controller.disconnect().await;
                    }
                    let _ = response.send(());
                    break;
                }
            }
        }
    }

    async fn flush(
        delegate: &ExposureDelegate,
        count: u32,
        controllers: Option<Vec<String>>,
    ) -> ArchonResult<()> {
        let targets = match controllers {
            None => delegate.controllers(),
            Some(names) => names
                .iter()
                .map(|name| delegate.controller(name))
                .collect::<ArchonResult<Vec<_>>>()?,
        };
        let results =
            future::join_all(targets.iter().map(|device| device.flush(count))).await;
        for result in results {
            result?;
        }
        Ok(())
    }

    async fn status_reports(
        &self,
        controller: Option<&str>,
    ) -> ArchonResult<Vec<StatusReport>> {
        let targets = match controller {
            None => self.delegate.controllers(),
            Some(name) => vec![self.delegate.controller(name)?],
        };

        let mut reports = Vec::with_capacity(targets.len());
        for device in targets {
            let status = device.status();
            self.reporter
                .status(device.name(), status, self.delegate.last_exposure_no())
                .await;
            if let Ok(geometry) = device.geometry() {
                self.reporter
                    .geometry(device.name(), geometry.to_json())
                    .await;
            }
            reports.push(StatusReport {
                controller: device.name().to_string(),
                status: status.bits(),
                status_names: status.names().iter().map(|s| s.to_string()).collect(),
                last_exposure_no: self.delegate.last_exposure_no(),
            });
        }
        Ok(reports)
    }

    async fn system(&self, controller: &str) -> ArchonResult<serde_json::Value> {
        let device = self.delegate.controller(controller)?;
        let map = device.system().await?;
        let value = serde_json::Value::Object(map);
        self.reporter.system(controller, value.clone()).await;
        Ok(value)
    }

    async fn frame(&self, controller: &str) -> ArchonResult<serde_json::Value> {
        let device = self.delegate.controller(controller)?;
        let info = device.frame().await?;
        let value = info.to_json();
        self.reporter.frame(controller, value.clone()).await;
        Ok(value)
    }

    async fn talk(&self, controller: &str, text: &str) -> ArchonResult<String> {
        let device = self.delegate.controller(controller)?;
        let reply = device.talk(text).await?;
        self.reporter.raw_reply(controller, reply.line()).await;
        if reply.succeeded() {
            Ok(reply.line().to_string())
        } else {
            Err(ArchonError::CommandFailed {
                command: text.to_string(),
            })
        }
    }

    async fn power(&self, controller: Option<&str>, on: bool) -> ArchonResult<()> {
        let targets = match controller {
            None => self.delegate.controllers(),
            Some(name) => vec![self.delegate.controller(name)?],
        };
        for device in targets {
            if device.status().intersects(
                ControllerStatus::EXPOSING
                    | ControllerStatus::READING
                    | ControllerStatus::FETCHING,
            ) {
                return Err(ArchonError::InvalidState(format!(
                    "{} is busy; cannot switch power",
                    device.name()
                )));
            }
            device.power(Some(on)).await?;
        }
        Ok(())
    }
}
