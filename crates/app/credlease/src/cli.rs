use clap::{Parser, Subcommand};

/// Lease-guarded OAuth credential refresh.
#[derive(Parser, Debug)]
#[command(name = "credlease", about)]
pub struct Cli {
    /// PostgreSQL connection URL.
    #[arg(
        long,
        global = true,
        env = "DATABASE_URL",
        default_value = "postgres://localhost:5432/credlease"
    )]
    pub database_url: String,

    /// Maximum number of database connections in the pool.
    #[arg(long, global = true, default_value_t = 5)]
    pub max_connections: u32,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug, PartialEq, Eq)]
pub enum Commands {
    /// Run the stale-lease reaper until Ctrl-C.
    Reaper {
        /// Milliseconds between passes (overrides `REAPER_INTERVAL_MS`).
        #[arg(long)]
        interval_ms: Option<u64>,

        /// Lease age in milliseconds after which it is cleared
        /// (overrides `LEASE_STALE_THRESHOLD_MS`).
        #[arg(long)]
        threshold_ms: Option<u64>,
    },

    /// Run one reaper pass and print the cleared server ids as JSON.
    Reap {
        /// Overrides `LEASE_STALE_THRESHOLD_MS`.
        #[arg(long)]
        threshold_ms: Option<u64>,
    },

    /// Refresh one server's tokens under its lease and print the outcome.
    Refresh {
        server_id: String,

        /// OAuth token endpoint.
        #[arg(long, env = "OAUTH_TOKEN_URL")]
        token_url: String,

        #[arg(long, env = "OAUTH_CLIENT_ID")]
        client_id: String,

        #[arg(long, env = "OAUTH_CLIENT_SECRET", hide_env_values = true)]
        client_secret: Option<String>,
    },

    /// Print the version.
    Version,
}

#[cfg(test)]
mod tests {
    use clap::CommandFactory;

    use super::*;

    #[test]
    fn cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn parses_reaper_overrides() {
        let cli = Cli::try_parse_from([
            "credlease",
            "reaper",
            "--interval-ms",
            "5000",
            "--threshold-ms",
            "120000",
        ])
        .unwrap();
        assert_eq!(
            cli.command,
            Commands::Reaper {
                interval_ms: Some(5000),
                threshold_ms: Some(120_000),
            }
        );
    }

    #[test]
    fn parses_refresh_with_explicit_endpoint() {
        let cli = Cli::try_parse_from([
            "credlease",
            "refresh",
            "gmail",
            "--token-url",
            "https://oauth2.example.com/token",
            "--client-id",
            "abc",
            "--max-connections",
            "2",
        ])
        .unwrap();
        assert_eq!(cli.max_connections, 2);
        match cli.command {
            Commands::Refresh {
                server_id,
                token_url,
                client_id,
                ..
            } => {
                assert_eq!(server_id, "gmail");
                assert_eq!(token_url, "https://oauth2.example.com/token");
                assert_eq!(client_id, "abc");
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn subcommand_is_required() {
        assert!(Cli::try_parse_from(["credlease"]).is_err());
    }
}
