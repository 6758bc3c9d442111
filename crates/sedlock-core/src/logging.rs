//! Logging bootstrapper shared by every sedlock binary.

use env_logger::Env;
use serde_json::json;
use std::env;
use std::io::Write;
use std::sync::OnceLock;

static INIT: OnceLock<()> = OnceLock::new();

const FORMAT_ENV: &str = "SEDLOCK_LOG_FORMAT";
const LEVEL_ENV: &str = "SEDLOCK_LOG_LEVEL";

/// Install the global logger once; later calls are no-ops.
///
/// `RUST_LOG` wins when set. Otherwise `SEDLOCK_LOG_LEVEL` or `default_level`
/// is used. Records are JSON lines unless `SEDLOCK_LOG_FORMAT=plain`.
pub fn init(default_level: &str) {
    let _ = INIT.get_or_init(|| configure(default_level));
}

fn configure(default_level: &str) {
    let level = env::var(LEVEL_ENV).unwrap_or_else(|_| default_level.to_string());
    let env = Env::default().default_filter_or(level);

    let mut builder = env_logger::Builder::from_env(env);
    if json_output(env::var(FORMAT_ENV).ok().as_deref()) {
        builder.format(|buf, record| {
            let payload = json!({
                "timestamp": buf.timestamp().to_string(),
                "level": record.level().to_string().to_lowercase(),
                "target": record.target(),
                "message": record.args().to_string(),
            });
            writeln!(buf, "{}", payload)
        });
    } else {
        builder.format(|buf, record| {
            writeln!(
                buf,
                "{} {} {} - {}",
                buf.timestamp(),
                record.level().to_string().to_lowercase(),
                record.target(),
                record.args()
            )
        });
    }

    if let Err(err) = builder.try_init() {
        eprintln!("failed to initialize logger: {}", err);
    }
}

fn json_output(format: Option<&str>) -> bool {
    !matches!(format.map(str::to_ascii_lowercase).as_deref(), Some("plain" | "text"))
}
