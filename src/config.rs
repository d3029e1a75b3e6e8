use std::time::Duration;

#[derive(Debug, Clone)]
pub struct Config {
    pub bind: String,
    pub port: u16,
    pub max_connections: usize,
    /// Absolute lifetime of a connection, not reset by activity.
    pub connection_timeout: Duration,
    pub loglevel: String,
    // Journal
    pub journal_enabled: bool,
    /// Empty = pick a file in `journal_dir`.
    pub journal_filename: String,
    pub journal_dir: String,
    pub journal_fsync: String,
    pub restore_from_journal: bool,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            bind: "0.0.0.0".to_string(),
            port: 3333,
            max_connections: 10,
            connection_timeout: Duration::from_secs(30),
            loglevel: "info".to_string(),
            journal_enabled: true,
            journal_filename: String::new(),
            journal_dir: "journal".to_string(),
            journal_fsync: "everysec".to_string(),
            restore_from_journal: false,
        }
    }
}

impl Config {
    pub fn from_args(args: &[String]) -> Self {
        let mut config = Config::default();
        let mut i = 0;
        while i < args.len() {
            match args[i].as_str() {
                "--port" => {
                    if i + 1 < args.len() {
                        if let Ok(p) = args[i + 1].parse() {
                            config.port = p;
                        }
                        i += 1;
                    }
                }
                "--bind" => {
                    if i + 1 < args.len() {
                        config.bind = args[i + 1].clone();
                        i += 1;
                    }
                }
                "--maxconn" => {
                    if i + 1 < args.len() {
                        if let Ok(n) = args[i + 1].parse() {
                            config.max_connections = n;
                        }
                        i += 1;
                    }
                }
                "--timeout" => {
                    if i + 1 < args.len() {
                        // 0 keeps the default lifetime
                        if let Ok(secs) = args[i + 1].parse::<u64>()
                            && secs > 0
                        {
                            config.connection_timeout = Duration::from_secs(secs);
                        }
                        i += 1;
                    }
                }
                "--journal" => {
                    if i + 1 < args.len() {
                        config.journal_filename = args[i + 1].clone();
                        i += 1;
                    }
                }
                "--journal-dir" => {
                    if i + 1 < args.len() {
                        config.journal_dir = args[i + 1].clone();
                        i += 1;
                    }
                }
                "--journal-enabled" => {
                    if i + 1 < args.len() {
                        config.journal_enabled = args[i + 1] == "yes";
                        i += 1;
                    }
                }
                "--journal-fsync" => {
                    if i + 1 < args.len() {
                        config.journal_fsync = args[i + 1].clone();
                        i += 1;
                    }
                }
                "--restore" => {
                    config.restore_from_journal = true;
                }
                "--loglevel" => {
                    if i + 1 < args.len() {
                        config.loglevel = args[i + 1].clone();
                        i += 1;
                    }
                }
                _ => {}
            }
            i += 1;
        }
        config
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(s: &str) -> Vec<String> {
        s.split_whitespace().map(str::to_string).collect()
    }

    #[test]
    fn test_defaults() {
        let config = Config::from_args(&[]);
        assert_eq!(config.port, 3333);
        assert_eq!(config.max_connections, 10);
        assert_eq!(config.connection_timeout, Duration::from_secs(30));
        assert!(config.journal_filename.is_empty());
        assert!(!config.restore_from_journal);
    }

    #[test]
    fn test_flags() {
        let config = Config::from_args(&args(
            "--port 4000 --maxconn 2 --timeout 5 --journal j.log --restore --journal-fsync always",
        ));
        assert_eq!(config.port, 4000);
        assert_eq!(config.max_connections, 2);
        assert_eq!(config.connection_timeout, Duration::from_secs(5));
        assert_eq!(config.journal_filename, "j.log");
        assert!(config.restore_from_journal);
        assert_eq!(config.journal_fsync, "always");
        assert_eq!(config.listen_addr(), "0.0.0.0:4000");
    }

    #[test]
    fn test_zero_timeout_keeps_default() {
        let config = Config::from_args(&args("--timeout 0"));
        assert_eq!(config.connection_timeout, Duration::from_secs(30));
    }
}
