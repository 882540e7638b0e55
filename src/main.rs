use clap::{CommandFactory, FromArgMatches};

use perfstat::cli::Args;

fn main() {
    // Session warnings (multiplexing, inaccurate PMU events) must reach the
    // user even without RUST_LOG.
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();

    let matches = Args::command().get_matches();
    let args = match Args::from_arg_matches(&matches) {
        Ok(args) => args,
        Err(e) => e.exit(),
    };

    if let Err(e) = perfstat::stat::run(args, &matches) {
        eprintln!("perfstat: {e:#}");
        std::process::exit(1);
    }
}
