use clap::{Parser, Subcommand};

use crate::models::user::Role;

/// usersys — user accounts with server-side bearer tokens
#[derive(Parser)]
#[command(name = "usersys", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start the HTTP server
    Serve {
        /// Port to bind
        #[arg(short, long, env = "USERSYS_PORT", default_value = "8080")]
        port: u16,

        /// Keep all data in process memory instead of Postgres
        #[arg(long)]
        memory: bool,
    },

    /// Apply pending database migrations and exit
    Migrate,

    /// Manage accounts
    User {
        #[command(subcommand)]
        command: UserCommands,
    },

    /// Inspect and revoke bearer tokens
    Token {
        #[command(subcommand)]
        command: TokenCommands,
    },
}

#[derive(Subcommand)]
pub enum UserCommands {
    /// Create an account (e.g. the first admin)
    Create {
        #[arg(long)]
        username: String,
        #[arg(long, env = "USERSYS_NEW_PASSWORD")]
        password: String,
        #[arg(long, default_value = "user", value_parser = parse_role)]
        role: Role,
        #[arg(long)]
        email: String,
        #[arg(long)]
        fullname: String,
    },
    /// Permanently remove an account and revoke its token
    Remove {
        #[arg(long)]
        id: i64,
    },
    /// Print the number of accounts
    Count,
}

#[derive(Subcommand)]
pub enum TokenCommands {
    /// List stored tokens (values are truncated)
    List,
    /// Print the number of stored tokens
    Count,
    /// Revoke a token by owner or by row id
    Revoke {
        #[arg(long, conflicts_with = "id", required_unless_present = "id")]
        username: Option<String>,
        #[arg(long)]
        id: Option<i64>,
    },
    /// Delete every expired token now
    PurgeExpired,
    /// Delete every token, logging everyone out
    PurgeAll,
}

fn parse_role(s: &str) -> Result<Role, String> {
    s.parse::<Role>().map_err(|e| e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_subcommand_means_serve() {
        let cli = Cli::try_parse_from(["usersys"]).unwrap();
        assert!(cli.command.is_none());
    }

    #[test]
    fn test_user_create_parses_role() {
        let cli = Cli::try_parse_from([
            "usersys", "user", "create", "--username", "root", "--password", "secret1", "--role",
            "admin", "--email", "root@example.com", "--fullname", "Root",
        ])
        .unwrap();
        match cli.command {
            Some(Commands::User { command: UserCommands::Create { role, .. } }) => {
                assert_eq!(role, Role::Admin)
            }
            _ => panic!("expected user create"),
        }
    }

    #[test]
    fn test_unknown_role_is_rejected() {
        let parsed = Cli::try_parse_from([
            "usersys", "user", "create", "--username", "x", "--password", "secret1", "--role",
            "owner", "--email", "x@example.com", "--fullname", "X",
        ]);
        assert!(parsed.is_err());
    }

    #[test]
    fn test_user_remove_and_count() {
        let cli = Cli::try_parse_from(["usersys", "user", "remove", "--id", "7"]).unwrap();
        assert!(matches!(
            cli.command,
            Some(Commands::User { command: UserCommands::Remove { id: 7 } })
        ));
        let cli = Cli::try_parse_from(["usersys", "user", "count"]).unwrap();
        assert!(matches!(cli.command, Some(Commands::User { command: UserCommands::Count })));
        assert!(Cli::try_parse_from(["usersys", "user", "remove"]).is_err());
    }

    #[test]
    fn test_token_revoke_takes_username_or_id() {
        let cli = Cli::try_parse_from(["usersys", "token", "revoke", "--id", "3"]).unwrap();
        match cli.command {
            Some(Commands::Token { command: TokenCommands::Revoke { username, id } }) => {
                assert_eq!(username, None);
                assert_eq!(id, Some(3));
            }
            _ => panic!("expected token revoke"),
        }
        let cli = Cli::try_parse_from(["usersys", "token", "revoke", "--username", "alice"]).unwrap();
        assert!(matches!(
            cli.command,
            Some(Commands::Token { command: TokenCommands::Revoke { username: Some(_), id: None } })
        ));

        assert!(Cli::try_parse_from(["usersys", "token", "revoke"]).is_err());
        assert!(Cli::try_parse_from([
            "usersys", "token", "revoke", "--username", "alice", "--id", "3"
        ])
        .is_err());
    }

    #[test]
    fn test_token_subcommands() {
        let cli = Cli::try_parse_from(["usersys", "token", "purge-expired"]).unwrap();
        assert!(matches!(
            cli.command,
            Some(Commands::Token { command: TokenCommands::PurgeExpired })
        ));
    }
}
