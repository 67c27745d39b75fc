//! The interactive command language read from stdin.

use sdb_session::{Intent, SourceLocation, StepKind};

pub const HELP: &str = "\
commands:
  c, continue            resume the game
  p, pause               suspend the game
  s, step [into|over|out] step (default: over)
  n, next                step over
  finish                 step out
  print <name>           show a local of the active frame
  b, break <loc>         add a breakpoint at FILE:LINE or TYPE::METHOD
  delete <n>             remove breakpoint #n
  enable <n>, disable <n>
  info                   show state, threads and breakpoints
  detach                 disconnect and leave the game running
  kill                   stop the game
  help";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Intent(Intent),
    Break(SourceLocation),
    Delete(u64),
    Enable { number: u64, enabled: bool },
    Info,
    Help,
}

/// Parse one input line. Blank lines parse to `None`.
pub fn parse(line: &str) -> Result<Option<Command>, String> {
    let mut words = line.split_whitespace();
    let Some(verb) = words.next() else {
        return Ok(None);
    };
    let rest: Vec<&str> = words.collect();

    let command = match (verb, rest.as_slice()) {
        ("c" | "continue", []) => Command::Intent(Intent::Continue),
        ("p" | "pause", []) => Command::Intent(Intent::Pause),
        ("s" | "step", []) | ("n" | "next", []) => Command::Intent(Intent::Step(StepKind::Over)),
        ("s" | "step", [kind]) => Command::Intent(Intent::Step(step_kind(kind)?)),
        ("finish", []) => Command::Intent(Intent::Step(StepKind::Out)),
        ("print", [_, ..]) => Command::Intent(Intent::Evaluate {
            expression: rest.join(" "),
        }),
        ("b" | "break", [location]) => Command::Break(location.parse()?),
        ("delete", [number]) => Command::Delete(breakpoint_number(number)?),
        ("enable", [number]) => Command::Enable {
            number: breakpoint_number(number)?,
            enabled: true,
        },
        ("disable", [number]) => Command::Enable {
            number: breakpoint_number(number)?,
            enabled: false,
        },
        ("info", []) => Command::Info,
        ("detach" | "q" | "quit", []) => Command::Intent(Intent::Detach),
        ("kill", []) => Command::Intent(Intent::Terminate),
        ("help" | "?", _) => Command::Help,
        _ => return Err(format!("unrecognized command `{}`; try `help`", line.trim())),
    };
    Ok(Some(command))
}

fn step_kind(word: &str) -> Result<StepKind, String> {
    match word {
        "into" | "in" => Ok(StepKind::Into),
        "over" => Ok(StepKind::Over),
        "out" => Ok(StepKind::Out),
        other => Err(format!("unknown step kind `{other}`; expected into, over or out")),
    }
}

fn breakpoint_number(word: &str) -> Result<u64, String> {
    word.trim_start_matches('#')
        .parse()
        .map_err(|_| format!("`{word}` is not a breakpoint number"))
}
