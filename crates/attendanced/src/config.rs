use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

/// Service configuration, loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Address to bind (default: 0.0.0.0).
    pub bind_addr: String,
    /// TCP port (default: 3000).
    pub port: u16,
    /// Path to the SQLite database file.
    pub db_path: PathBuf,
    /// Number of pooled database connections.
    pub db_pool_size: usize,
    /// How long a write waits on a locked database before failing.
    pub db_busy_timeout_ms: u64,
    /// Directory uploaded snapshots are written to and served from.
    pub upload_dir: PathBuf,
    /// Largest accepted request body, in bytes.
    pub max_upload_bytes: usize,
}

impl Config {
    /// Load configuration from `PORT` and `ATTENDANCE_*` environment
    /// variables with defaults.
    pub fn from_env() -> Self {
        let data_dir = std::env::var("XDG_DATA_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| {
                let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
                PathBuf::from(home).join(".local/share")
            })
            .join("attendance");

        let db_path = std::env::var("ATTENDANCE_DB_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| data_dir.join("attendance.db"));

        Self {
            bind_addr: std::env::var("ATTENDANCE_BIND_ADDR")
                .unwrap_or_else(|_| "0.0.0.0".to_string()),
            port: env_parse("PORT", 3000),
            db_path,
            db_pool_size: env_parse("ATTENDANCE_DB_POOL_SIZE", 4),
            db_busy_timeout_ms: env_parse("ATTENDANCE_DB_BUSY_TIMEOUT_MS", 5000),
            upload_dir: std::env::var("ATTENDANCE_UPLOAD_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("uploads")),
            max_upload_bytes: env_parse("ATTENDANCE_MAX_UPLOAD_BYTES", 10 * 1024 * 1024),
        }
    }

    pub fn socket_addr(&self) -> Result<SocketAddr, std::net::AddrParseError> {
        let ip: IpAddr = self.bind_addr.parse()?;
        Ok(SocketAddr::new(ip, self.port))
    }

    pub fn db_busy_timeout(&self) -> Duration {
        Duration::from_millis(self.db_busy_timeout_ms)
    }
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    match std::env::var(key) {
        Ok(raw) => raw.parse().unwrap_or_else(|_| {
            tracing::warn!(key, value = %raw, "ignoring unparsable value");
            default
        }),
        Err(_) => default,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_socket_addr() {
        let config = Config {
            bind_addr: "127.0.0.1".into(),
            port: 3000,
            db_path: PathBuf::from("a.db"),
            db_pool_size: 1,
            db_busy_timeout_ms: 250,
            upload_dir: PathBuf::from("uploads"),
            max_upload_bytes: 1024,
        };
        assert_eq!(config.socket_addr().unwrap().port(), 3000);
        assert_eq!(config.db_busy_timeout(), Duration::from_millis(250));

        let v6 = Config {
            bind_addr: "::".into(),
            ..config.clone()
        };
        let addr = v6.socket_addr().unwrap();
        assert!(addr.is_ipv6());
        assert_eq!(addr.port(), 3000);

        let bad = Config {
            bind_addr: "not an address".into(),
            ..config
        };
        assert!(bad.socket_addr().is_err());
    }
}
