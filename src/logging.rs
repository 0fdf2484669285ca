use std::time::Instant;
use tracing::info;
use tracing_subscriber::EnvFilter;

pub fn init_tracing(verbose: u8) {
    let default_filter = match verbose {
        0 => "ada_choropleth=info",
        1 => "ada_choropleth=debug",
        _ => "trace",
    };
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    let _ = tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(env_filter)
        .with_target(false)
        .try_init();
}

/// Wall-clock timer for one pipeline stage.
pub struct Stage {
    started: Instant,
}

impl Stage {
    pub fn start(message: &str) -> Self {
        info!("{}", message);
        Self { started: Instant::now() }
    }

    pub fn elapsed_secs(&self) -> f64 {
        self.started.elapsed().as_secs_f64()
    }
}
