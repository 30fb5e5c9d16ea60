use crate::cli::args::{Cli, Command, TraceCommand};

use super::{approve, approve_script, delegate, digest, eval, keygen, trace};

/// Run the parsed command and return the process exit code.
pub fn dispatch(cli: Cli) -> i32 {
    match cli.cmd {
        Command::Eval(args) => eval::cmd_eval(args),
        Command::Digest(args) => digest::cmd_digest(args),
        Command::Approve(args) => approve::cmd_approve(args),
        Command::Delegate(args) => delegate::cmd_delegate(args),
        Command::ApproveScript(args) => approve_script::cmd_approve_script(args),
        Command::Keygen(args) => keygen::cmd_keygen(args),
        Command::Trace { cmd } => match cmd {
            TraceCommand::Verify(args) => trace::cmd_trace_verify(args),
        },
    }
}
