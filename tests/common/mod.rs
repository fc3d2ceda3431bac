//! Shared test fixtures: a mock Archon controller speaking the real wire
//! protocol over TCP, and in-memory implementations of the daemon ports.
#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpListener;
use tokio::sync::Notify;

use archond::config::{
    ChecksumSettings, ControllerConfig, DetectorConfig, FileSettings, Settings, TapConfig,
    TimeoutSettings,
};
use archond::controller::frame::FrameData;
use archond::controller::ArchonController;
use archond::core::{
    FitsHeader, FrameWriter, NullSensorReader, ReplyEvent, ReplySink, Reporter, SystemClock,
};
use archond::error::{ArchonError, ArchonResult};
use archond::exposure::{ExposureDelegate, FileCounterStore};

// =============================================================================
// Mock Archon controller
// =============================================================================

#[derive(Debug, Clone)]
pub struct MockBuffer {
    pub base: u32,
    pub width: u32,
    pub height: u32,
    pub sample: u8,
    pub complete: bool,
    pub frame: u64,
    pub timestamp: u64,
}

pub struct MockState {
    pub config_lines: Vec<String>,
    pub params: HashMap<String, i64>,
    pub buffers: [MockBuffer; 3],
    pub wbuf: u8,
    pub frame_counter: u64,
    pub power: i64,
    pub powergood: i64,
    /// Commands (first word) answered with a NAK.
    pub nak_commands: HashSet<String>,
    /// Commands (first word) that never get a reply.
    pub swallow_commands: HashSet<String>,
    /// WCONFIG line number answered with a NAK.
    pub nak_wconfig_line: Option<usize>,
    /// How long a readout takes to complete a buffer.
    pub readout_ms: u64,
}

impl MockState {
    pub fn new(width: u32, height: u32) -> MockState {
        let buffer = |base| MockBuffer {
            base,
            width,
            height,
            sample: 0,
            complete: false,
            frame: 0,
            timestamp: 0,
        };
        MockState {
            config_lines: default_acf_lines(width, height),
            params: HashMap::new(),
            buffers: [buffer(0x1000), buffer(0x2000), buffer(0x3000)],
            wbuf: 1,
            frame_counter: 0,
            power: 4,
            powergood: 1,
            nak_commands: HashSet::new(),
            swallow_commands: HashSet::new(),
            nak_wconfig_line: None,
            readout_ms: 150,
        }
    }

    fn param(&self, name: &str) -> i64 {
        self.params.get(&name.to_uppercase()).copied().unwrap_or(0)
    }
}

/// A minimal but realistic ACF for the mock: the parameter table the
/// exposure engine pokes, plus the timing-core keywords geometry needs.
pub fn default_acf_lines(width: u32, height: u32) -> Vec<String> {
    vec![
        format!("LINECOUNT={height}"),
        format!("PIXELCOUNT={width}"),
        "TAPLINES=1".to_string(),
        "TAPLINE0=\"AD1L, 1, 1000\"".to_string(),
        "PARAMETER0=\"Exposures=0\"".to_string(),
        "PARAMETER1=\"ReadOut=0\"".to_string(),
        "PARAMETER2=\"AbortExposure=0\"".to_string(),
        "PARAMETER3=\"DoFlush=0\"".to_string(),
        "PARAMETER4=\"WaitCount=0\"".to_string(),
        "PARAMETER5=\"AutoFlush=1\"".to_string(),
        "PARAMETER6=\"IntMS=100\"".to_string(),
        "PARAMETER7=\"FlushCount=2\"".to_string(),
        format!("PARAMETER8=\"Lines={height}\""),
        format!("PARAMETER9=\"Pixels={width}\""),
        "PARAMETERS=10".to_string(),
    ]
}

/// Deterministic pixel payload for a buffer: depends on the frame number so
/// successive readouts differ.
pub fn buffer_payload(buf: &MockBuffer) -> Vec<u8> {
    let count = (buf.width * buf.height) as usize;
    let mut bytes = Vec::with_capacity(count * 2);
    for i in 0..count {
        let px = ((i as u64 + buf.frame * 7) & 0xFFFF) as u16;
        bytes.extend_from_slice(&px.to_le_bytes());
    }
    bytes
}

pub struct MockArchon {
    pub addr: SocketAddr,
    pub state: Arc<Mutex<MockState>>,
    disconnect: Arc<Notify>,
}

impl MockArchon {
    pub async fn start(state: MockState) -> MockArchon {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let state = Arc::new(Mutex::new(state));
        let disconnect = Arc::new(Notify::new());

        let accept_state = Arc::clone(&state);
        let accept_disconnect = Arc::clone(&disconnect);
        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    break;
                };
                stream.set_nodelay(true).ok();
                tokio::spawn(handle_client(
                    stream,
                    Arc::clone(&accept_state),
                    Arc::clone(&accept_disconnect),
                ));
            }
        });

        MockArchon {
            addr,
            state,
            disconnect,
        }
    }

    /// Severs every live connection, as a network fault would.
    pub fn drop_clients(&self) {
        self.disconnect.notify_waiters();
    }

    pub fn with_state<R>(&self, f: impl FnOnce(&mut MockState) -> R) -> R {
        f(&mut self.state.lock().unwrap())
    }
}

async fn handle_client(
    stream: tokio::net::TcpStream,
    state: Arc<Mutex<MockState>>,
    disconnect: Arc<Notify>,
) {
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);
    let mut line = Vec::new();

    loop {
        line.clear();
        tokio::select! {
            _ = disconnect.notified() => break,
            read = reader.read_until(b'\n', &mut line) => {
                match read {
                    Ok(0) | Err(_) => break,
                    Ok(_) => {}
                }
                if respond(&line, &mut write_half, &state).await.is_err() {
                    break;
                }
            }
        }
    }
}

async fn respond(
    raw: &[u8],
    write: &mut OwnedWriteHalf,
    state: &Arc<Mutex<MockState>>,
) -> std::io::Result<()> {
    let Ok(text) = std::str::from_utf8(raw) else {
        return Ok(());
    };
    let text = text.trim_end();
    if !text.starts_with('>') || text.len() < 3 {
        return Ok(());
    }
    let id = &text[1..3];
    let command = &text[3..];
    let word = command.split_whitespace().next().unwrap_or("");

    let (swallow, nak) = {
        let s = state.lock().unwrap();
        (
            s.swallow_commands.contains(word),
            s.nak_commands.contains(word),
        )
    };
    if swallow {
        return Ok(());
    }
    if nak {
        return write.write_all(format!("?{id}\n").as_bytes()).await;
    }

    let ack = |payload: String| format!("<{id}{payload}\n");

    if command == "STATUS" {
        let payload = {
            let s = state.lock().unwrap();
            format!("POWER={} POWERGOOD={} OVERHEAT=0 BACKPLANE_TEMP=32.1", s.power, s.powergood)
        };
        return write.write_all(ack(payload).as_bytes()).await;
    }

    if command == "SYSTEM" {
        let payload = "BACKPLANE_ID=83CE0FFD BACKPLANE_VERSION=1.0.1104 BACKPLANE_TYPE=1 \
                       MOD1_TYPE=2 MOD2_TYPE=5"
            .to_string();
        return write.write_all(ack(payload).as_bytes()).await;
    }

    if command == "FRAME" {
        let payload = {
            let s = state.lock().unwrap();
            frame_reply(&s)
        };
        return write.write_all(ack(payload).as_bytes()).await;
    }

    if let Some(rest) = command.strip_prefix("FASTLOADPARAM ") {
        if let Some((name, value)) = rest.rsplit_once(' ') {
            if let Ok(value) = value.parse::<i64>() {
                state
                    .lock()
                    .unwrap()
                    .params
                    .insert(name.to_uppercase(), value);
            }
        }
        return write.write_all(ack(String::new()).as_bytes()).await;
    }

    if command == "RELEASETIMING" {
        trigger_timing(state);
        return write.write_all(ack(String::new()).as_bytes()).await;
    }

    if command == "CLEARCONFIG" {
        state.lock().unwrap().config_lines.clear();
        return write.write_all(ack(String::new()).as_bytes()).await;
    }

    if let Some(rest) = command.strip_prefix("WCONFIG") {
        let (n, content) = rest.split_at(4.min(rest.len()));
        let n = usize::from_str_radix(n, 16).unwrap_or(0);
        let naked = {
            let mut s = state.lock().unwrap();
            if s.nak_wconfig_line == Some(n) {
                true
            } else {
                if s.config_lines.len() <= n {
                    s.config_lines.resize(n + 1, String::new());
                }
                s.config_lines[n] = content.to_string();
                false
            }
        };
        if naked {
            return write.write_all(format!("?{id}\n").as_bytes()).await;
        }
        return write.write_all(ack(String::new()).as_bytes()).await;
    }

    if let Some(n) = command.strip_prefix("RCONFIG") {
        let n = usize::from_str_radix(n, 16).unwrap_or(usize::MAX);
        let payload = {
            let s = state.lock().unwrap();
            s.config_lines.get(n).cloned().unwrap_or_default()
        };
        return write.write_all(ack(payload).as_bytes()).await;
    }

    if let Some(rest) = command.strip_prefix("FETCH") {
        if rest.len() == 16 {
            let addr = u32::from_str_radix(&rest[..8], 16).unwrap_or(0);
            let blocks = u32::from_str_radix(&rest[8..], 16).unwrap_or(0);
            let payload = {
                let s = state.lock().unwrap();
                s.buffers
                    .iter()
                    .find(|b| b.base == addr)
                    .map(buffer_payload)
            };
            if let Some(mut payload) = payload {
                payload.resize(blocks as usize * 1024, 0);
                for chunk in payload.chunks(1024) {
                    write.write_all(format!("<{id}:").as_bytes()).await?;
                    write.write_all(chunk).await?;
                }
                return Ok(());
            }
        }
        return write.write_all(format!("?{id}\n").as_bytes()).await;
    }

    if command == "POWERON" {
        state.lock().unwrap().power = 4;
        return write.write_all(ack(String::new()).as_bytes()).await;
    }
    if command == "POWEROFF" {
        state.lock().unwrap().power = 2;
        return write.write_all(ack(String::new()).as_bytes()).await;
    }

    // POLLON/POLLOFF, HOLDTIMING, APPLY*, LOADTIMING, LOCKn, anything else.
    write.write_all(ack(String::new()).as_bytes()).await
}

fn frame_reply(s: &MockState) -> String {
    let mut out = format!("TIMER={:08X} RBUF=1 WBUF={}", s.frame_counter * 100, s.wbuf);
    for (i, b) in s.buffers.iter().enumerate() {
        let n = i + 1;
        out.push_str(&format!(
            " BUF{n}SAMPLE={} BUF{n}COMPLETE={} BUF{n}MODE=0 BUF{n}BASE={} BUF{n}FRAME={} \
             BUF{n}WIDTH={} BUF{n}HEIGHT={} BUF{n}PIXELS=0 BUF{n}LINES=0 BUF{n}TIMESTAMP={:08X}",
            b.sample,
            u8::from(b.complete),
            b.base,
            b.frame,
            b.width,
            b.height,
            b.timestamp,
        ));
    }
    out
}

/// Emulates the timing script: `RELEASETIMING` with `Exposures > 0` starts
/// an integration (honouring `AbortExposure` and `ReadOut`); with
/// `ReadOut = 1` alone it reads the pending charge.
fn trigger_timing(state: &Arc<Mutex<MockState>>) {
    let (exposures, readout_only) = {
        let s = state.lock().unwrap();
        (s.param("Exposures"), s.param("ReadOut") == 1)
    };

    if exposures > 0 {
        let state = Arc::clone(state);
        tokio::spawn(async move {
            let int_ms = {
                let s = state.lock().unwrap();
                s.param("IntMS") as u64 * 10
            };
            tokio::time::sleep(Duration::from_millis(int_ms)).await;

            let do_read = {
                let mut s = state.lock().unwrap();
                if s.param("AbortExposure") == 1 {
                    return;
                }
                s.params.insert("EXPOSURES".to_string(), 0);
                let do_read = s.param("ReadOut") == 1;
                if do_read {
                    let w = s.wbuf as usize - 1;
                    s.buffers[w].complete = false;
                }
                do_read
            };
            if do_read {
                run_readout(&state).await;
            }
        });
    } else if readout_only {
        let state = Arc::clone(state);
        tokio::spawn(async move {
            {
                let mut s = state.lock().unwrap();
                let w = s.wbuf as usize - 1;
                s.buffers[w].complete = false;
            }
            run_readout(&state).await;
        });
    }
}

async fn run_readout(state: &Arc<Mutex<MockState>>) {
    let readout_ms = state.lock().unwrap().readout_ms;
    tokio::time::sleep(Duration::from_millis(readout_ms)).await;
    let mut s = state.lock().unwrap();
    let w = s.wbuf as usize - 1;
    s.frame_counter += 1;
    let frame = s.frame_counter;
    s.buffers[w].complete = true;
    s.buffers[w].frame = frame;
    s.buffers[w].timestamp = frame * 1000;
    s.wbuf = s.wbuf % 3 + 1;
}

// =============================================================================
// In-memory ports
// =============================================================================

/// Collects reply events for assertions.
pub struct MemorySink {
    events: Mutex<Vec<ReplyEvent>>,
}

impl MemorySink {
    pub fn new() -> Arc<MemorySink> {
        Arc::new(MemorySink {
            events: Mutex::new(Vec::new()),
        })
    }

    pub fn events(&self) -> Vec<ReplyEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn with_key(&self, key: &str) -> Vec<ReplyEvent> {
        self.events()
            .into_iter()
            .filter(|event| event.key == key)
            .collect()
    }
}

#[async_trait]
impl ReplySink for MemorySink {
    async fn emit(&self, event: ReplyEvent) {
        self.events.lock().unwrap().push(event);
    }
}

/// Deterministic writer: header JSON, a newline, then the raw pixel bytes.
/// Byte-identical output for identical inputs, which is what the recovery
/// guarantees are asserted against.
pub struct MemoryWriter;

#[async_trait]
impl FrameWriter for MemoryWriter {
    async fn write(&self, data: &FrameData, header: &FitsHeader, path: &Path) -> ArchonResult<()> {
        let mut bytes = serde_json::to_vec(header)
            .map_err(|err| ArchonError::Persist(err.to_string()))?;
        bytes.push(b'\n');
        bytes.extend(data.to_le_bytes());
        std::fs::write(path, bytes)?;
        Ok(())
    }
}

/// Fails the first `failures` writes, then delegates to [`MemoryWriter`].
pub struct FlakyWriter {
    remaining: Mutex<u32>,
    inner: MemoryWriter,
}

impl FlakyWriter {
    pub fn new(failures: u32) -> FlakyWriter {
        FlakyWriter {
            remaining: Mutex::new(failures),
            inner: MemoryWriter,
        }
    }
}

#[async_trait]
impl FrameWriter for FlakyWriter {
    async fn write(&self, data: &FrameData, header: &FitsHeader, path: &Path) -> ArchonResult<()> {
        {
            let mut remaining = self.remaining.lock().unwrap();
            if *remaining > 0 {
                *remaining -= 1;
                return Err(ArchonError::Persist("injected write failure".to_string()));
            }
        }
        self.inner.write(data, header, path).await
    }
}

// =============================================================================
// Settings and wiring helpers
// =============================================================================

pub fn fast_timeouts() -> TimeoutSettings {
    TimeoutSettings {
        connect_ms: 2_000,
        command_ms: 2_000,
        status_ms: 1_000,
        write_config_ms: 1_000,
        write_config_delay_us: 10,
        apply_ms: 1_000,
        power_ms: 2_000,
        readout_max_s: 5,
        flushing_s: 0.05,
        poll_interval_ms: 50,
    }
}

pub fn detector(width: u32, height: u32) -> DetectorConfig {
    DetectorConfig {
        area: [0, 0, width, height],
        sensor: "A".to_string(),
        taps: vec![TapConfig {
            id: "AD1L".to_string(),
            gain: 2.7,
            readnoise: 3.9,
        }],
    }
}

pub fn test_settings(
    data_dir: &Path,
    controllers: &[(&str, SocketAddr, u32, u32)],
) -> Settings {
    let mut map = HashMap::new();
    for (name, addr, width, height) in controllers {
        let mut detectors = HashMap::new();
        detectors.insert("r1".to_string(), detector(*width, *height));
        map.insert(
            name.to_string(),
            ControllerConfig {
                host: addr.ip().to_string(),
                port: addr.port(),
                enabled: true,
                detectors,
            },
        );
    }
    Settings {
        observatory: "lco".to_string(),
        hemisphere: None,
        controllers: map,
        timeouts: fast_timeouts(),
        files: FileSettings {
            data_dir: data_dir.to_path_buf(),
            template: "archon-{controller}-{ccd}-{exposure_no:08}.fits".to_string(),
            concurrent_writes: true,
        },
        checksum: ChecksumSettings::default(),
    }
}

/// Builds connected controllers and a delegate wired to in-memory ports.
pub async fn build_delegate(
    settings: Settings,
    sink: Arc<MemorySink>,
    writer: Arc<dyn FrameWriter>,
    counter_path: &Path,
) -> (Arc<ExposureDelegate>, HashMap<String, Arc<ArchonController>>) {
    let settings = Arc::new(settings);
    let mut controllers = HashMap::new();
    for (name, descriptor) in &settings.controllers {
        let device = Arc::new(ArchonController::new(
            name,
            descriptor.clone(),
            settings.timeouts.clone(),
        ));
        device.connect().await.expect("mock connect");
        controllers.insert(name.clone(), device);
    }

    let delegate = Arc::new(ExposureDelegate::new(
        Arc::clone(&settings),
        controllers.clone(),
        Reporter::new(sink),
        writer,
        Arc::new(NullSensorReader),
        Arc::new(SystemClock),
        Arc::new(FileCounterStore::new(counter_path)),
    ));
    (delegate, controllers)
}
