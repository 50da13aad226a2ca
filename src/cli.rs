//! Command-line argument parsing.

use clap::Parser;

/// A target specified by either a numeric account id or an `@handle`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UserRef {
    Id(u64),
    Handle(String),
}

impl std::str::FromStr for UserRef {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.parse::<u64>() {
            Ok(id) => Ok(UserRef::Id(id)),
            Err(_) => Ok(UserRef::Handle(s.strip_prefix('@').unwrap_or(s).to_string())),
        }
    }
}

/// Concurrent, rate-governed media-archival agent.
#[derive(Debug, Parser)]
#[command(name = "archivist", version, about)]
pub struct Cli {
    /// Direct account to archive, by id or @handle. Repeatable.
    #[arg(long = "user", value_name = "ID|@HANDLE")]
    pub users: Vec<UserRef>,

    /// List whose members become accounts to archive. Repeatable.
    #[arg(long = "list", value_name = "ID")]
    pub lists: Vec<u64>,

    /// Account whose friends-list is treated as a list. Repeatable.
    #[arg(long = "foll", value_name = "ID|@HANDLE")]
    pub foll: Vec<UserRef>,

    /// Rerun the configuration prompt and exit.
    #[arg(long = "conf")]
    pub conf: bool,

    /// Verbose logs and per-endpoint request counters.
    #[arg(long = "dbg")]
    pub dbg: bool,

    /// Issue a follow request to protected accounts before archiving.
    #[arg(long = "auto-follow")]
    pub auto_follow: bool,

    /// Skip the post-run retry pass over the failure dumper.
    #[arg(long = "no-retry")]
    pub no_retry: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn user_ref_parses_numeric_id() {
        assert_eq!("42".parse::<UserRef>().unwrap(), UserRef::Id(42));
    }

    #[test]
    fn user_ref_parses_handle_with_at() {
        assert_eq!("@jack".parse::<UserRef>().unwrap(), UserRef::Handle("jack".to_string()));
    }

    #[test]
    fn user_ref_parses_handle_without_at() {
        assert_eq!("jack".parse::<UserRef>().unwrap(), UserRef::Handle("jack".to_string()));
    }

    #[test]
    fn cli_parses_repeatable_flags() {
        let cli = Cli::parse_from([
            "archivist",
            "--user",
            "42",
            "--user",
            "@jack",
            "--list",
            "1000",
            "--dbg",
            "--no-retry",
        ]);
        assert_eq!(cli.users, vec![UserRef::Id(42), UserRef::Handle("jack".to_string())]);
        assert_eq!(cli.lists, vec![1000]);
        assert!(cli.dbg);
        assert!(cli.no_retry);
        assert!(!cli.auto_follow);
    }
}
