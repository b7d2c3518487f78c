extern crate chan;
extern crate chan_signal;
extern crate crossbeam;
extern crate env_logger;
extern crate getopts;
#[macro_use]
extern crate log;
extern crate sota;
extern crate time;

use chan_signal::Signal;
use env_logger::LogBuilder;
use getopts::{Matches, Options};
use log::{LogLevelFilter, LogRecord};
use std::cell::RefCell;
use std::rc::Rc;
use std::{env, process};

use sota::datatype::Config;
use sota::dispatch::Dispatcher;
use sota::secondary::Secondary;
use sota::server::{ExitReason, SecondaryTcpServer};


macro_rules! exit {
    ($code:expr, $fmt:expr, $($arg:tt)*) => {{
        println!($fmt, $($arg)*);
        process::exit($code);
    }}
}


fn main() {
    let cli = parse_args();
    let version = start_logging(&cli);
    info!("Secondary update agent {} starting.", version);
    let config = build_config(&cli);

    let secondary = Secondary::new(&config)
        .unwrap_or_else(|err| exit!(1, "couldn't start the secondary: {}", err));
    let secondary = Rc::new(RefCell::new(secondary));
    let dispatcher = Dispatcher::new(secondary.clone());

    let primary = match config.network.primary_ip.is_empty() {
        true  => None,
        false => Some((config.network.primary_ip.as_str(), config.network.primary_port)),
    };
    let mut server = SecondaryTcpServer::with_announcement(
            dispatcher,
            config.network.port,
            config.uptane.force_install_completion,
            primary)
        .unwrap_or_else(|err| exit!(1, "couldn't start the server: {}", err));

    let stop = server.stop_handle();
    crossbeam::scope(|scope| {
        let signals = chan_signal::notify(&[Signal::INT, Signal::TERM]);
        scope.spawn(move || start_signal_handler(&signals, stop));

        if server.run() == ExitReason::RebootNeeded {
            secondary.borrow_mut().complete_install();
            info!("Installation complete, exiting for reboot.");
        }
        process::exit(0);
    });
}

fn start_signal_handler(signals: &chan::Receiver<Signal>, stop: sota::server::StopHandle) {
    let _ = signals.recv();
    stop.stop();
}

fn parse_args() -> Matches {
    let args = env::args().collect::<Vec<String>>();
    let program = args[0].clone();
    let mut opts = Options::new();

    opts.optflag("h", "help", "print this help menu then quit");
    opts.optflag("v", "version", "print the version then quit");
    opts.optopt("", "loglevel", "set the log level 0-5 (trace to fatal)", "LEVEL");
    opts.optmulti("c", "config", "read a toml config file (later files take precedence)", "PATH");
    opts.optopt("p", "server-port", "change the command server listening port", "PORT");
    opts.optopt("", "ecu-serial", "change the serial of this secondary ECU", "TEXT");
    opts.optopt("", "ecu-hardware-id", "change the hardware id of this secondary ECU", "TEXT");

    let cli = opts.parse(&args[1..])
        .unwrap_or_else(|err| exit!(1, "{}\n{}", err, opts.usage(&format!("Usage: {} [options]", program))));
    if cli.opt_present("help") {
        exit!(0, "{}", opts.usage(&format!("Usage: {} [options]", program)));
    } else if cli.opt_present("version") {
        exit!(0, "{}", option_env!("SOTA_VERSION").unwrap_or("unknown"));
    }
    cli
}

fn start_logging(cli: &Matches) -> String {
    let version = option_env!("SOTA_VERSION").unwrap_or("unknown");
    let level = match cli.opt_str("loglevel").as_ref().map(String::as_str) {
        None      => LogLevelFilter::Info,
        Some("0") => LogLevelFilter::Trace,
        Some("1") => LogLevelFilter::Debug,
        Some("2") => LogLevelFilter::Info,
        Some("3") => LogLevelFilter::Warn,
        Some("4") | Some("5") => LogLevelFilter::Error,
        Some(level) => exit!(1, "invalid --loglevel: {}", level),
    };

    let mut builder = LogBuilder::new();
    builder.format(move |record: &LogRecord| {
        let timestamp = format!("{}", time::now_utc().rfc3339());
        format!("{} ({}): {} - {}", timestamp, version, record.level(), record.args())
    });
    builder.filter(None, level);
    if let Ok(var) = env::var("RUST_LOG") {
        builder.parse(&var);
    }
    builder.init().expect("builder already initialized");

    version.to_string()
}

fn build_config(cli: &Matches) -> Config {
    let files = cli.opt_strs("config");
    let mut config = if files.is_empty() {
        warn!("no --config given, using default values");
        Config::default()
    } else {
        Config::load(&files).unwrap_or_else(|err| exit!(1, "couldn't load config: {}", err))
    };

    cli.opt_str("server-port").map(|port| {
        config.network.port = port.parse().unwrap_or_else(|_| exit!(1, "invalid --server-port: {}", port));
    });
    cli.opt_str("ecu-serial").map(|serial| config.uptane.ecu_serial = serial);
    cli.opt_str("ecu-hardware-id").map(|hwid| config.uptane.ecu_hardware_id = hwid);

    config
}
