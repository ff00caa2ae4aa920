use anyhow::{ensure, Context, Result};
use lazy_static::lazy_static;
use log::{info, LevelFilter, Log, Metadata, Record};
use scanlink::{
    BuildVariant, ControllerSession, IoCondition, SerialLink, SessionConfig, SimulatedBoard,
};
use std::{
    env,
    os::unix::io::RawFd,
    path::PathBuf,
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};
use tempfile::TempDir;

lazy_static! {
    static ref BEGIN: Instant = Instant::now();
}

struct StderrLogger;

impl Log for StderrLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record) {
        if self.enabled(record.metadata()) {
            eprintln!(
                "{:>9.3} {:<5} {}: {}",
                BEGIN.elapsed().as_secs_f64(),
                record.level(),
                record.target(),
                record.args()
            );
        }
    }

    fn flush(&self) {}
}

static LOGGER: StderrLogger = StderrLogger;

fn init_logging() {
    let level = env::var("SCANLINK_LOG")
        .ok()
        .and_then(|s| s.parse::<LevelFilter>().ok())
        .unwrap_or(LevelFilter::Info);
    if log::set_logger(&LOGGER).is_ok() {
        log::set_max_level(level);
    }
}

/// A simulated board answering on the master side of a pseudo terminal
struct BoardEmulator {
    master: RawFd,
    slave: RawFd,
}

impl BoardEmulator {
    fn new() -> Result<Self> {
        use nix::{pty, sys::termios};

        let ptys = pty::openpty(None::<&pty::Winsize>, None::<&termios::Termios>)
            .context("Could not allocate pty")?;

        Ok(BoardEmulator {
            master: ptys.master,
            slave: ptys.slave,
        })
    }

    fn ttyname(&self) -> Result<PathBuf> {
        nix::unistd::ttyname(self.slave).context("Could not get TTY name")
    }

    /// Feeds everything read from the pty to `board` and writes its replies back
    fn serve(&self, board: SimulatedBoard) -> JoinHandle<()> {
        let master = self.master;
        thread::spawn(move || {
            let mut recv = [0u8; 512];
            loop {
                let n = match nix::unistd::read(master, &mut recv) {
                    Ok(0) | Err(_) => break,
                    Ok(n) => n,
                };
                let reply = board.receive(&recv[..n]);
                let mut sent = 0;
                while sent < reply.len() {
                    match nix::unistd::write(master, &reply[sent..]) {
                        Ok(n) => sent += n,
                        Err(_) => return,
                    }
                }
            }
        })
    }
}

impl Drop for BoardEmulator {
    fn drop(&mut self) {
        let _ = nix::unistd::close(self.master);
        let _ = nix::unistd::close(self.slave);
    }
}

fn load_config(dir: &TempDir) -> Result<SessionConfig> {
    let path = dir.path().join("scanlink.json");
    let json = serde_json::json!({
        "poll_interval_ms": 5,
        "default_field_size": 160.0,
    });
    std::fs::write(&path, json.to_string()).context("Could not write config file")?;
    SessionConfig::from_json_file(&path).context("Could not load config file")
}

fn stream_square(session: &ControllerSession) -> Result<()> {
    session.open_stream()?;
    session.set_speed(800.0)?;
    session.set_jump_speed(2000.0)?;
    session.jump_xy(-10.0, -10.0)?;
    session.set_laser(true)?;
    for (x, y) in [(10.0, -10.0), (10.0, 10.0), (-10.0, 10.0), (-10.0, -10.0)] {
        session.line_xy(x, y)?;
    }
    session.arc_xy(0.0, 0.0, 0.5)?;
    session.set_laser(false)?;
    session.close_build()?;
    session
        .wait_idle(Duration::from_secs(5))
        .context("Board did not run the streamed square")
}

fn store_marker(session: &ControllerSession) -> Result<usize> {
    session.open_build(BuildVariant::File, "marker")?;
    session.loop_begin(3)?;
    session.if_begin(IoCondition::equal(0x01, 0x01))?;
    session.line_xy(5.0, 0.0)?;
    session.if_else()?;
    session.jump_xy(0.0, 5.0)?;
    session.if_end()?;
    session.loop_end()?;
    let slot = session.close_build()?;
    slot.context("File build was not stored")
}

fn main() -> Result<()> {
    init_logging();
    let work_dir = TempDir::new().context("Could not create work directory")?;
    let config = load_config(&work_dir)?;

    let emulator = BoardEmulator::new()?;
    let board = SimulatedBoard::new(&config.flash);
    board.push_uart_input(b"ready\n");
    let _server = emulator.serve(board.clone());
    let tty = emulator.ttyname()?;

    let session = ControllerSession::new(config)?;
    session
        .connect(&tty.to_string_lossy(), SerialLink::default())
        .with_context(|| format!("Could not connect to {}", tty.display()))?;
    info!("board identifies as {:?}", session.identity());

    let report = session.system_check()?;
    report.verify().context("System check failed")?;

    stream_square(&session)?;
    info!("streamed {} instructions", board.streamed().len());

    let slot = store_marker(&session)?;
    let index = session.file_index("marker")?;
    ensure!(slot == index, "marker stored in slot {slot}, found in {index}");
    let mut entry = session.first_file();
    while let Some(file) = entry {
        info!("file {:?}: {} bytes", file.name, file.size);
        entry = session.next_file();
    }
    let (total, used) = session.memory_sizes();
    info!("flash file area: {used} of {total} bytes used");

    session.store_boot_script("marker")?;
    let script = session.read_boot_script()?;
    ensure!(script == "marker", "boot script read back as {script:?}");

    session.uart_write(b"status?\n")?;
    let line = session.uart_read(64)?;
    info!("uart answered {:?}", String::from_utf8_lossy(&line));
    ensure!(board.uart_output() == b"status?\n", "uart write did not arrive");

    session.stop()?;
    session.disconnect()?;
    info!("done");
    Ok(())
}
