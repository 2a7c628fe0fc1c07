//! CLI argument parsing with clap derive macros.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// Drive a running Flutter app through a marionette automation peer.
///
/// Each command starts the peer over stdio, performs the JSON-RPC handshake,
/// runs, and stops the peer again. Commands that touch the UI first attach
/// to the app's runtime debug endpoint (--uri or MARIONETTE_VM_URI).
#[derive(Debug, Parser)]
#[command(name = "marionette", version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Peer command line [env: MARIONETTE_PEER] [default: marionette_mcp]
    #[arg(long, global = true, value_name = "CMD")]
    pub peer: Option<String>,

    /// App debug endpoint, e.g. ws://127.0.0.1:52132/<token>=/ws [env: MARIONETTE_VM_URI]
    #[arg(long, global = true, value_name = "URI")]
    pub uri: Option<String>,

    /// Per-request timeout in milliseconds [env: MARIONETTE_TIMEOUT_MS] [default: 15000]
    #[arg(long, global = true, value_name = "MS")]
    pub timeout: Option<u64>,

    /// Log protocol traffic and peer stderr
    #[arg(short, long, global = true)]
    pub verbose: bool,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    #[command(flatten)]
    Peer(PeerCommand),

    /// Show an end-to-end usage example
    Examples,
}

/// Commands that start the peer and talk to it.
#[derive(Debug, Subcommand)]
pub enum PeerCommand {
    /// Handshake with the peer and print what it reports about itself
    Probe,

    /// List the tools the peer offers
    Tools,

    /// Attach the peer to the app and print its status
    #[command(after_help = "\
Examples:
  marionette connect --uri ws://127.0.0.1:52132/z7Ey8M6DvVo=/ws
  MARIONETTE_VM_URI=ws://127.0.0.1:52132/z7Ey8M6DvVo=/ws marionette connect")]
    Connect,

    /// List the interactive elements on screen
    #[command(after_help = "\
Examples:
  marionette elements                   # One line per element
  marionette elements --json            # Decoded elements as JSON
  marionette elements --raw             # Listing text exactly as the peer sent it")]
    Elements(ElementsArgs),

    /// Tap a widget by its text or key, or a screen coordinate
    #[command(after_help = "\
Examples:
  marionette tap 'Find Gym'             # Tap by display text
  marionette tap find_gym               # Tap by widget key
  marionette tap --at 52,755            # Tap logical pixel (52, 755)")]
    Tap(TapArgs),

    /// Capture the screen to an image file
    #[command(after_help = "\
Examples:
  marionette screenshot                 # screenshot_<date>_<time>.png
  marionette screenshot -o home.png     # Explicit file name")]
    Screenshot(ScreenshotArgs),

    /// Call any peer tool and print its raw result
    #[command(after_help = "\
Examples:
  marionette call get_interactive_elements
  marionette call enter_text --args '{\"key\": \"search_field\", \"input\": \"gym\"}'")]
    Call(CallArgs),
}

#[derive(Debug, clap::Args)]
pub struct ElementsArgs {
    /// Print decoded elements as JSON
    #[arg(long, conflicts_with = "raw")]
    pub json: bool,

    /// Print the listing text unchanged
    #[arg(long)]
    pub raw: bool,
}

#[derive(Debug, clap::Args)]
pub struct TapArgs {
    /// Display text or key of the widget
    #[arg(required_unless_present = "at", conflicts_with = "at")]
    pub target: Option<String>,

    /// Tap a coordinate instead, as X,Y in logical pixels
    #[arg(long, value_name = "X,Y", allow_hyphen_values = true)]
    pub at: Option<String>,
}

#[derive(Debug, clap::Args)]
pub struct ScreenshotArgs {
    /// Output file. Further images get a numeric suffix.
    #[arg(short, long, value_name = "PATH")]
    pub output: Option<PathBuf>,
}

#[derive(Debug, clap::Args)]
pub struct CallArgs {
    /// Tool name, as listed by 'marionette tools'
    pub tool: String,

    /// Tool arguments as a JSON object
    #[arg(long, default_value = "{}", value_name = "JSON")]
    pub args: String,
}

/// End-to-end example text for the `examples` command.
pub const EXAMPLES_TEXT: &str = r#"End-to-end example: Find a gym from the home screen

Run the app in debug mode and note the VM service URI it prints, e.g.
  A Dart VM Service is available at: http://127.0.0.1:52132/z7Ey8M6DvVo=/

# 1. Point marionette at the app's debug endpoint
export MARIONETTE_VM_URI=ws://127.0.0.1:52132/z7Ey8M6DvVo=/ws

# 2. Check the peer starts and answers
marionette probe

# 3. See what can be tapped
marionette elements

# 4. Tap a button by its text
marionette tap "Find Gym"

# 5. Navigation items without text can be tapped by coordinate
marionette tap --at 156,755

# 6. Capture the result
marionette screenshot -o find_gym.png

Add --verbose to any command to see the JSON-RPC traffic and peer stderr.
"#;

#[cfg(test)]
mod tests {
    use super::{Cli, Commands, PeerCommand};
    use clap::Parser;

    #[test]
    fn test_tap_by_text() {
        let cli = Cli::parse_from(["marionette", "tap", "Find Gym"]);
        match cli.command {
            Commands::Peer(PeerCommand::Tap(args)) => {
                assert_eq!(args.target.as_deref(), Some("Find Gym"));
                assert!(args.at.is_none());
            }
            _ => panic!("Expected tap command"),
        }
    }

    #[test]
    fn test_tap_by_coordinate() {
        let cli = Cli::parse_from(["marionette", "tap", "--at", "52,755"]);
        match cli.command {
            Commands::Peer(PeerCommand::Tap(args)) => {
                assert!(args.target.is_none());
                assert_eq!(args.at.as_deref(), Some("52,755"));
            }
            _ => panic!("Expected tap command"),
        }
    }

    #[test]
    fn test_tap_needs_exactly_one_target() {
        assert!(Cli::try_parse_from(["marionette", "tap"]).is_err());
        assert!(Cli::try_parse_from(["marionette", "tap", "Home", "--at", "1,2"]).is_err());
    }

    #[test]
    fn test_global_flags_after_subcommand() {
        let cli = Cli::parse_from([
            "marionette",
            "elements",
            "--json",
            "--uri",
            "ws://127.0.0.1:52132/z7Ey8M6DvVo=/ws",
            "--timeout",
            "3000",
            "-v",
        ]);
        assert_eq!(
            cli.uri.as_deref(),
            Some("ws://127.0.0.1:52132/z7Ey8M6DvVo=/ws")
        );
        assert_eq!(cli.timeout, Some(3000));
        assert!(cli.verbose);
        match cli.command {
            Commands::Peer(PeerCommand::Elements(args)) => assert!(args.json && !args.raw),
            _ => panic!("Expected elements command"),
        }
    }

    #[test]
    fn test_examples_is_not_a_peer_command() {
        let cli = Cli::parse_from(["marionette", "examples"]);
        assert!(matches!(cli.command, Commands::Examples));
        let cli = Cli::parse_from(["marionette", "probe"]);
        assert!(matches!(cli.command, Commands::Peer(PeerCommand::Probe)));
    }

    #[test]
    fn test_elements_json_and_raw_conflict() {
        assert!(Cli::try_parse_from(["marionette", "elements", "--json", "--raw"]).is_err());
    }

    #[test]
    fn test_call_defaults_to_empty_arguments() {
        let cli = Cli::parse_from(["marionette", "call", "get_interactive_elements"]);
        match cli.command {
            Commands::Peer(PeerCommand::Call(args)) => {
                assert_eq!(args.tool, "get_interactive_elements");
                assert_eq!(args.args, "{}");
            }
            _ => panic!("Expected call command"),
        }
    }
}
