//! Command-line surface. Three scalars, so a hand-rolled flag parser is
//! simpler than pulling in a config-file stack with nothing left to point
//! it at.

pub struct NagatoConfig {
    pub listen_host: String,
    pub listen_port: u16,
    pub verbosity: u8,
    pub max_connections: usize,
}

impl Default for NagatoConfig {
    fn default() -> Self {
        Self {
            listen_host: "127.0.0.1".to_string(),
            listen_port: 8080,
            verbosity: 0,
            max_connections: 1024,
        }
    }
}

impl NagatoConfig {
    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.listen_host, self.listen_port)
    }

    pub fn from_args(args: impl Iterator<Item = String>) -> anyhow::Result<Self> {
        let mut cfg = NagatoConfig::default();
        let mut args = args.peekable();

        while let Some(arg) = args.next() {
            match arg.as_str() {
                "-H" | "--host" => {
                    cfg.listen_host = args
                        .next()
                        .ok_or_else(|| anyhow::anyhow!("{arg} requires a value"))?;
                }
                "-p" | "--port" => {
                    let raw = args
                        .next()
                        .ok_or_else(|| anyhow::anyhow!("{arg} requires a value"))?;
                    cfg.listen_port = raw
                        .parse()
                        .map_err(|_| anyhow::anyhow!("invalid port: {raw}"))?;
                }
                "-v" | "--verbose" => {
                    cfg.verbosity = cfg.verbosity.saturating_add(1);
                }
                "-vv" => {
                    cfg.verbosity = cfg.verbosity.saturating_add(2);
                }
                "--max-connections" => {
                    let raw = args
                        .next()
                        .ok_or_else(|| anyhow::anyhow!("{arg} requires a value"))?;
                    cfg.max_connections = raw
                        .parse()
                        .map_err(|_| anyhow::anyhow!("invalid max-connections: {raw}"))?;
                }
                "-h" | "--help" => {
                    print_help();
                    std::process::exit(0);
                }
                other => {
                    return Err(anyhow::anyhow!("unrecognized argument: {other}"));
                }
            }
        }

        Ok(cfg)
    }
}

fn print_help() {
    println!(
        "nagato [-H host] [-p port] [-v] [--max-connections N]\n\n\
         -H, --host              listen address (default 127.0.0.1)\n\
         -p, --port              listen port (default 8080)\n\
         -v, --verbose           increase log verbosity (repeatable)\n\
         --max-connections N     concurrent connection ceiling (default 1024)"
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_when_no_args_given() {
        let cfg = NagatoConfig::from_args(std::iter::empty()).unwrap();
        assert_eq!(cfg.listen_host, "127.0.0.1");
        assert_eq!(cfg.listen_port, 8080);
        assert_eq!(cfg.verbosity, 0);
    }

    #[test]
    fn parses_host_and_port() {
        let args = ["-H", "0.0.0.0", "-p", "9090"].map(str::to_string);
        let cfg = NagatoConfig::from_args(args.into_iter()).unwrap();
        assert_eq!(cfg.listen_host, "0.0.0.0");
        assert_eq!(cfg.listen_port, 9090);
    }

    #[test]
    fn repeated_verbose_flags_accumulate() {
        let args = ["-v", "-v", "-v"].map(str::to_string);
        let cfg = NagatoConfig::from_args(args.into_iter()).unwrap();
        assert_eq!(cfg.verbosity, 3);
    }

    #[test]
    fn rejects_unknown_flag() {
        let args = ["--nonsense".to_string()];
        assert!(NagatoConfig::from_args(args.into_iter()).is_err());
    }

    #[test]
    fn rejects_invalid_port() {
        let args = ["-p", "not-a-port"].map(str::to_string);
        assert!(NagatoConfig::from_args(args.into_iter()).is_err());
    }
}
