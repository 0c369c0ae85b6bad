//! Tracing subscriber setup.

use std::fs::OpenOptions;
use std::sync::Mutex;

use tracing_subscriber::EnvFilter;

use papr_types::Settings;

/// Install the global subscriber.
///
/// `RUST_LOG` wins over `log_level`. With `log_file` set, output is appended
/// to that file instead of stderr. Returns `false` when a subscriber was
/// already installed or the log file could not be opened.
pub fn init_logging(settings: &Settings) -> bool {
    let filter = env_filter(settings);

    match &settings.log_file {
        Some(path) => {
            let file = match OpenOptions::new().create(true).append(true).open(path) {
                Ok(file) => file,
                Err(e) => {
                    eprintln!("papr: cannot open log file {}: {}", path.display(), e);
                    return false;
                }
            };
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_ansi(false)
                .with_writer(Mutex::new(file))
                .try_init()
                .is_ok()
        }
        None => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .try_init()
            .is_ok(),
    }
}

fn env_filter(settings: &Settings) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::try_new(&settings.log_level).unwrap_or_else(|_| EnvFilter::new("info"))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_second_init_is_a_no_op() {
        let settings = Settings::default();
        let _ = init_logging(&settings);
        assert!(!init_logging(&settings));
    }

    #[test]
    fn test_unopenable_log_file() {
        let settings = Settings {
            log_file: Some("/nonexistent-dir/papr/papr.log".into()),
            ..Default::default()
        };
        assert!(!init_logging(&settings));
    }
}
