use std::env;
use std::path::PathBuf;

use snafu::{OptionExt, ResultExt, Snafu};

use arbor_chat::{ChatError, HistoryFormat, read_tree};
use arbor_tree::{ConversationThread, Message, UnresolvedBranch, find_paused_workflow_node};

#[derive(Debug, Clone)]
struct InspectArgs {
    history_path: PathBuf,
    format: HistoryFormat,
    policy: UnresolvedBranch,
}

#[derive(Debug, Snafu)]
enum InspectError {
    #[snafu(display(
        "usage: arbor-inspect <history.json> [--nested] [--latest|--stop] (missing history path)"
    ))]
    MissingHistoryPath { stage: &'static str },
    #[snafu(display("unknown argument '{raw}'"))]
    UnknownArgument { stage: &'static str, raw: String },
    #[snafu(display("failed to load conversation: {source}"))]
    LoadConversation {
        stage: &'static str,
        source: ChatError,
    },
    #[snafu(display("failed to activate paused workflow path: {source}"))]
    ActivatePath {
        stage: &'static str,
        source: arbor_tree::TreeError,
    },
}

type InspectResult<T> = Result<T, InspectError>;

fn main() {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .init();

    if let Err(error) = run() {
        println!("inspect_ok=false");
        eprintln!("inspect_error={error}");
        std::process::exit(1);
    }
}

fn run() -> InspectResult<()> {
    let args = parse_args(env::args().skip(1))?;
    let tree = read_tree(&args.history_path, args.format).context(LoadConversationSnafu {
        stage: "load-history",
    })?;

    let paused = find_paused_workflow_node(&tree);
    let mut thread = ConversationThread::from_tree(tree, args.policy);
    if let Some(paused_id) = &paused {
        thread.activate_path(paused_id).context(ActivatePathSnafu {
            stage: "activate-paused-path",
        })?;
    }

    println!("node_count={}", thread.tree().len());
    println!("root_count={}", thread.tree().roots().len());
    println!(
        "paused_node={}",
        paused.as_ref().map(|id| id.as_str()).unwrap_or("-")
    );

    let path = thread.project();
    println!("active_path_len={}", path.len());
    for (depth, message) in path.iter().enumerate() {
        println!("{}", describe(depth, message));
    }
    println!("inspect_ok=true");
    Ok(())
}

fn describe(depth: usize, message: &Message) -> String {
    let position = &message.sibling_position;
    let preview: String = message.content.chars().take(60).collect();
    format!(
        "{depth:>3} {role:<17} {id} [{index}/{count}] {status:?} {preview:?}",
        role = format!("{:?}", message.role),
        id = message.id,
        index = position.index + 1,
        count = position.count,
        status = message.status,
    )
}

fn parse_args(args: impl IntoIterator<Item = String>) -> InspectResult<InspectArgs> {
    let mut history_path = None;
    let mut format = HistoryFormat::Flat;
    let mut policy = UnresolvedBranch::Latest;

    for argument in args {
        match argument.as_str() {
            "--nested" => format = HistoryFormat::Nested,
            "--latest" => policy = UnresolvedBranch::Latest,
            "--stop" => policy = UnresolvedBranch::Stop,
            flag if flag.starts_with("--") => {
                return UnknownArgumentSnafu {
                    stage: "parse-args",
                    raw: argument,
                }
                .fail();
            }
            _ => history_path = Some(PathBuf::from(argument)),
        }
    }

    Ok(InspectArgs {
        history_path: history_path.context(MissingHistoryPathSnafu {
            stage: "parse-args-history-path",
        })?,
        format,
        policy,
    })
}
