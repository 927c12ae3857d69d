use std::process::exit;

use tracing::{error, info};

use nurvus::agent::{Agent, AgentSettings};
use nurvus::cli::Cli;
use nurvus::context::Context;
use nurvus::logging::LoggingConfig;

fn main() {
    let cli = Cli::init();

    if let Err(err) = LoggingConfig::default().try_init() {
        eprintln!("could not initialise logging: {}", err);
        exit(1);
    }

    let shutdown_ctx = Context::<bool>::new();
    let handler_ctx = shutdown_ctx.clone();
    if let Err(err) = ctrlc::set_handler(move || {
        let _ = handler_ctx.cancel_all(true);
    }) {
        error!("could not install the termination handler: {}", err);
        exit(1);
    }

    let settings = AgentSettings::resolve(&cli);
    if let Err(err) = Agent::new(settings).run(shutdown_ctx) {
        error!("the agent exited with an error: {}", err);
        exit(1);
    }

    info!("exiting gracefully");
}
