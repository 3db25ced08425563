use log::{error, info};
use reactor_server::{AsyncLogger, Server, ServerConfig, ServerError, ServerResult};
use std::env;
use std::thread;
use std::time::Duration;

const METRICS_INTERVAL: Duration = Duration::from_secs(10);
const METRICS_POLL: Duration = Duration::from_millis(200);

fn main() -> ServerResult<()> {
    // Parse command-line arguments
    let args: Vec<String> = env::args().collect();
    if args.len() > 2 && args[1] == "--write-default-config" {
        return save_default_config(&args[2]);
    }
    let config = match args.get(1) {
        Some(path) => ServerConfig::from_json_file(path)?,
        None => ServerConfig::new(),
    };
    config.validate()?;

    let logger = AsyncLogger::new(&config.log)?;
    log::set_boxed_logger(Box::new(logger.handle()))
        .map_err(|e| ServerError::Config(format!("cannot install logger: {}", e)))?;
    log::set_max_level(logger.level());

    let result = serve(config);
    if let Err(e) = &result {
        error!("Server failed: {}", e);
    }
    logger.shutdown();
    result
}

fn serve(config: ServerConfig) -> ServerResult<()> {
    let server = Server::new(config)?;
    let handle = server.handle();
    let metrics = server.metrics();
    info!("Listening on {}", server.local_addr());

    let signal_handle = handle.clone();
    ctrlc::set_handler(move || {
        info!("Received shutdown signal. Stopping server...");
        signal_handle.stop();
    })
    .map_err(|e| ServerError::Config(format!("cannot install signal handler: {}", e)))?;

    // Periodic metrics snapshot
    let reporter_handle = handle.clone();
    let reporter = thread::Builder::new()
        .name("metrics".to_string())
        .spawn(move || {
            let mut waited = Duration::ZERO;
            while !reporter_handle.is_stopped() {
                thread::sleep(METRICS_POLL);
                waited += METRICS_POLL;
                if waited >= METRICS_INTERVAL {
                    waited = Duration::ZERO;
                    info!("Server metrics\n{}", metrics.format());
                }
            }
        })?;

    let result = server.run();
    handle.stop();
    let _ = reporter.join();
    result
}

// Save default configuration to a file
fn save_default_config(path: &str) -> ServerResult<()> {
    let config = ServerConfig::new();
    config.save_to_json_file(path)?;
    println!("Default configuration saved to: {}", path);
    Ok(())
}
