use mimalloc::MiMalloc;
#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

mod share;

use clap::Parser;
use share::FileShare;
use std::{
    io,
    net::{IpAddr, SocketAddr},
    path::PathBuf,
    process,
    sync::Arc,
    thread,
    time::Duration,
};
use tachyon_reactor::library::{
    config::ServerConfig,
    error::{ReactorError, Result},
    http::server::HttpServer,
    logging::{FileSink, LogConfig, LogSink, Logger, StderrSink},
};
use tracing::{dispatcher, error, info, level_filters::LevelFilter};

#[derive(Parser, Debug)]
#[command(name = "tachyon-reactor")]
#[command(about = "Event-driven HTTP file share", long_about = None)]
struct Args {
    /// Address to listen on
    #[arg(default_value = "0.0.0.0")]
    ip: IpAddr,

    #[arg(default_value_t = 8080)]
    port: u16,

    /// I/O event loops [default: one per CPU]
    #[arg(long)]
    workers: Option<usize>,

    /// Handler threads; 0 runs handlers on the I/O threads
    #[arg(long, default_value_t = 0)]
    app_workers: usize,

    /// Seconds of silence before a connection is dropped
    #[arg(long, default_value_t = 80)]
    idle_timeout: u64,

    /// Seconds between idle sweeps
    #[arg(long, default_value_t = 30)]
    sweep_interval: u64,

    /// Directory holding the shared files
    #[arg(long, default_value = "./share")]
    root: PathBuf,

    #[arg(long, default_value = "info")]
    log_level: LevelFilter,

    /// Append logs to this file instead of stderr
    #[arg(long)]
    log_file: Option<PathBuf>,

    #[arg(long)]
    pin_cores: bool,

    #[arg(long)]
    realtime: bool,
}

/// Blocks SIGINT/SIGTERM for this thread and every thread spawned after it,
/// so only the signal thread ever sees them. SIGPIPE is ignored outright.
fn block_shutdown_signals() -> io::Result<libc::sigset_t> {
    unsafe {
        let mut set: libc::sigset_t = std::mem::zeroed();
        libc::sigemptyset(&mut set);
        libc::sigaddset(&mut set, libc::SIGINT);
        libc::sigaddset(&mut set, libc::SIGTERM);
        let rc = libc::pthread_sigmask(libc::SIG_BLOCK, &set, std::ptr::null_mut());
        if rc != 0 {
            return Err(io::Error::from_raw_os_error(rc));
        }
        libc::signal(libc::SIGPIPE, libc::SIG_IGN);
        Ok(set)
    }
}

fn wait_for_signal(set: &libc::sigset_t) -> libc::c_int {
    let mut signal: libc::c_int = 0;
    loop {
        if unsafe { libc::sigwait(set, &mut signal) } == 0 {
            return signal;
        }
    }
}

fn serve(args: Args, logger: &Logger, signals: libc::sigset_t) -> Result<()> {
    let share = FileShare::open(&args.root).map_err(ReactorError::setup("share directory"))?;
    info!("Sharing {}", share.root().display());

    let mut config = ServerConfig::new(SocketAddr::new(args.ip, args.port));
    config
        .set_app_workers(args.app_workers)
        .set_idle_timeout(Duration::from_secs(args.idle_timeout))
        .set_sweep_interval(Duration::from_secs(args.sweep_interval))
        .set_pin_cores(args.pin_cores)
        .set_realtime(args.realtime)
        .set_dispatch(logger.dispatch().clone());
    if let Some(workers) = args.workers {
        config.set_workers(workers);
    }
    let config = config.build();
    info!("{config:?}");

    let mut server = HttpServer::new(config, share)?;
    let handle = server.handle();
    let dispatch = logger.dispatch().clone();
    thread::Builder::new()
        .name("signals".into())
        .spawn(move || {
            let _log_guard = dispatcher::set_default(&dispatch);
            let signal = wait_for_signal(&signals);
            info!("Signal {signal} received, shutting down");
            handle.stop();
        })
        .map_err(ReactorError::setup("signal thread"))?;

    info!("Serving on http://{}", server.local_addr());
    server.run()?;
    info!("All loops joined");
    Ok(())
}

fn main() {
    let args = Args::parse();
    let signals = match block_shutdown_signals() {
        Ok(set) => set,
        Err(err) => {
            eprintln!("failed to block shutdown signals: {err}");
            process::exit(1);
        }
    };

    let sink: Arc<dyn LogSink> = match &args.log_file {
        Some(path) => match FileSink::open(path) {
            Ok(sink) => Arc::new(sink),
            Err(err) => {
                eprintln!("cannot open log file {}: {err}", path.display());
                process::exit(1);
            }
        },
        None => Arc::new(StderrSink),
    };
    let logger = Logger::new(LogConfig {
        level: args.log_level,
        ansi: args.log_file.is_none(),
        sink,
    });

    let outcome = dispatcher::with_default(logger.dispatch(), || {
        let outcome = serve(args, &logger, signals);
        if let Err(err) = &outcome {
            error!("Server failed: {err}");
        }
        outcome
    });
    logger.flush();
    if outcome.is_err() {
        process::exit(1);
    }
}
