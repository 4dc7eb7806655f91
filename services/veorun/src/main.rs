use clap::{App, Arg};
use std::env;
use std::process;
use stub_veorun::server::Server;
use veowire::logging;

fn main() {
    let matches = App::new("stub-veorun")
        .version("0.1.0")
        .about("Worker process for the stub VE offload runtime.")
        .arg(
            Arg::with_name("log-level")
                .long("log-level")
                .takes_value(true)
                .help("Log level override (trace, debug, info, warning, error)"),
        )
        .get_matches();

    if let Some(level) = matches.value_of("log-level") {
        env::set_var(logging::LEVEL_ENV_VAR, level);
    }

    let log = logging::init();

    let server = match Server::bind(&log) {
        Ok(server) => server,
        Err(err) => {
            logging::crit!(log, "cannot bind worker socket"; "error" => %err);
            process::exit(1);
        }
    };

    if let Err(err) = server.run() {
        logging::crit!(log, "worker failed"; "error" => %err);
        process::exit(1);
    }
}
