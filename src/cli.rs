use std::path::PathBuf;

use clap::{Parser, Subcommand};

use crate::directory::ChannelKind;

#[derive(Parser, Debug)]
#[command(name = "slack-console")]
#[command(about = "Terminal client for Slack workspaces", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    #[command(about = "Listen to workspace messages over Socket Mode")]
    Listen {
        #[arg(env = "SLACK_CONSOLE_WORKSPACE", help = "Slack workspace")]
        workspace: String,

        #[arg(long, help = "Do not download or display attachments")]
        no_files: bool,
    },

    #[command(about = "Display message history for a channel")]
    History {
        #[arg(env = "SLACK_CONSOLE_WORKSPACE", help = "Slack workspace")]
        workspace: String,

        #[arg(help = "The name of the channel to display history from")]
        channel: String,

        #[arg(
            short,
            long,
            default_value_t = 1,
            help = "The number of days worth of history to display"
        )]
        days: i64,
    },

    #[command(about = "Post a message or upload a file to a channel")]
    Post {
        #[arg(env = "SLACK_CONSOLE_WORKSPACE", help = "Slack workspace")]
        workspace: String,

        #[arg(help = "The name of the channel to post to")]
        channel: String,

        #[arg(short, long, help = "Message text to post")]
        message: Option<String>,

        #[arg(short, long, help = "A file to upload and share")]
        file: Option<PathBuf>,

        #[arg(short, long, help = "Post in thread THREAD")]
        thread: Option<String>,

        #[arg(long, help = "Read message text from stdin")]
        stdin: bool,

        #[arg(short, long, help = "Wrap the message in Slack code markup")]
        code: bool,
    },

    #[command(about = "List the workspace's channels")]
    Channels {
        #[arg(env = "SLACK_CONSOLE_WORKSPACE", help = "Slack workspace")]
        workspace: String,

        #[arg(long, help = "Only list one kind: channel, group, im or mpim")]
        kind: Option<ChannelKind>,
    },

    #[command(about = "List the workspace's users")]
    Users {
        #[arg(env = "SLACK_CONSOLE_WORKSPACE", help = "Slack workspace")]
        workspace: String,
    },

    #[command(about = "Manipulate the local file cache")]
    Files {
        #[arg(env = "SLACK_CONSOLE_WORKSPACE", help = "Slack workspace")]
        workspace: String,

        #[command(subcommand)]
        command: FilesCommand,
    },
}

#[derive(Subcommand, Debug)]
pub enum FilesCommand {
    #[command(about = "List cached file information")]
    List,
}

#[cfg(test)]
mod tests {
    use clap::CommandFactory;

    use super::*;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn listen_parses_workspace_and_flags() {
        let cli = Cli::parse_from(["slack-console", "listen", "acme", "--no-files"]);
        match cli.command {
            Commands::Listen {
                workspace,
                no_files,
            } => {
                assert_eq!(workspace, "acme");
                assert!(no_files);
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn history_defaults_to_one_day() {
        let cli = Cli::parse_from(["slack-console", "history", "acme", "general"]);
        match cli.command {
            Commands::History { days, channel, .. } => {
                assert_eq!(days, 1);
                assert_eq!(channel, "general");
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }
}
