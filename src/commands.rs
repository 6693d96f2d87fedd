use crate::guided_fix::state::GuidedFixEvent;

pub const HELP: &str = "\
commands:
  confirm            accept the suggested step completion
  reject             keep working on the current step
  done               mark the current step complete yourself
  pause | resume     pause or resume guidance
  override           continue despite an identity mismatch
  unavailable <item> you don't have <item>; look for a substitute
  use | decline      accept or decline the suggested substitute
  accept             start the updated plan
  ask [question]     ask a question (without text, start listening)
  say <question>     finish a question started with `ask`
  cancel             cancel the question
  dismiss            close the answer
  retry              retry after an error
  grant | deny       camera permission
  reset              start over
  status             print the current state
  stop               end the session";

/// One line of user input.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    /// Applied to the session in order, as one write.
    Dispatch(Vec<GuidedFixEvent>),
    Status,
    Help,
}

pub fn parse_command(line: &str) -> Result<Command, String> {
    let line = line.trim();
    let (verb, rest) = match line.split_once(char::is_whitespace) {
        Some((verb, rest)) => (verb, rest.trim()),
        None => (line, ""),
    };

    let event = match verb.to_ascii_lowercase().as_str() {
        "" | "help" | "?" => return Ok(Command::Help),
        "status" => return Ok(Command::Status),
        "ask" if rest.is_empty() => GuidedFixEvent::UserStartedQuestion,
        "ask" => {
            return Ok(Command::Dispatch(vec![
                GuidedFixEvent::UserStartedQuestion,
                GuidedFixEvent::QuestionCaptured { question: rest.to_string() },
            ]))
        }
        "say" => GuidedFixEvent::QuestionCaptured { question: rest.to_string() },
        "confirm" => GuidedFixEvent::UserConfirmedStep,
        "reject" => GuidedFixEvent::UserRejectedCompletion,
        "done" => GuidedFixEvent::UserMarkedComplete,
        "pause" => GuidedFixEvent::UserPaused,
        "resume" => GuidedFixEvent::UserResumed,
        "override" => GuidedFixEvent::UserOverride,
        "unavailable" => GuidedFixEvent::UserItemUnavailable { item: rest.to_string() },
        "use" => GuidedFixEvent::UserConfirmedSubstitute,
        "decline" => GuidedFixEvent::UserRejectedSubstitute,
        "accept" => GuidedFixEvent::UserAcceptedPlan,
        "cancel" => GuidedFixEvent::QuestionCancelled,
        "dismiss" => GuidedFixEvent::UserDismissedAnswer,
        "retry" => GuidedFixEvent::UserRetry,
        "grant" => GuidedFixEvent::PermissionsGranted,
        "deny" => GuidedFixEvent::PermissionsDenied,
        "reset" => GuidedFixEvent::SessionReset,
        "stop" | "quit" | "exit" => GuidedFixEvent::SessionStopped,
        other => return Err(format!("unknown command `{other}`, type `help`")),
    };
    Ok(Command::Dispatch(vec![event]))
}
