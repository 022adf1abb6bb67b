//! The two debug verbs named in spec §6/§9: `debug.xid` (show or set the
//! global request-id counter) and `debug.srandom` (reseed pseudo-random
//! state, default seed 1). Modeled as a tiny blocking stdin REPL, started
//! only when the binary is invoked with `--debug-cli` — the teacher has
//! no CLI-verb dispatcher of its own (it is config-driven, `display_config`
//! at startup and nothing else), so this is grounded directly in the
//! debug-command table spec.md names rather than in any teacher file.

use crate::session;
use std::io::{self, BufRead, Write};
use std::sync::atomic::{AtomicU64, Ordering};

/// Process-wide LCG state for `debug.srandom`. Nothing else in the crate
/// consumes randomness yet, but the command itself is still real: it
/// reseeds this state and a future consumer (a load-shedding jitter, a
/// cache-busting test hook) would read it through `srandom_next`.
static RANDOM_STATE: AtomicU64 = AtomicU64::new(1);

pub fn srandom_seed(seed: u64) {
    RANDOM_STATE.store(seed.max(1), Ordering::Relaxed);
}

pub fn srandom_next() -> u64 {
    let mut x = RANDOM_STATE.load(Ordering::Relaxed);
    x = x.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
    RANDOM_STATE.store(x, Ordering::Relaxed);
    x
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    XidShow,
    XidSet(u64),
    SrandomDefault,
    SrandomSet(u64),
    Unknown(String),
}

pub fn parse(line: &str) -> Command {
    let mut parts = line.split_whitespace();
    match parts.next() {
        Some("debug.xid") => match parts.next() {
            Some(v) => v
                .parse()
                .map(Command::XidSet)
                .unwrap_or_else(|_| Command::Unknown(line.to_string())),
            None => Command::XidShow,
        },
        Some("debug.srandom") => match parts.next() {
            Some(v) => v
                .parse()
                .map(Command::SrandomSet)
                .unwrap_or_else(|_| Command::Unknown(line.to_string())),
            None => Command::SrandomDefault,
        },
        _ => Command::Unknown(line.to_string()),
    }
}

pub fn execute(cmd: Command) -> String {
    match cmd {
        Command::XidShow => format!("XID {}", session::debug_get_xid()),
        Command::XidSet(v) => {
            session::debug_set_xid(v);
            format!("XID {}", v)
        }
        Command::SrandomDefault => {
            srandom_seed(1);
            "200 debug.srandom 1".to_string()
        }
        Command::SrandomSet(seed) => {
            srandom_seed(seed);
            format!("200 debug.srandom {}", seed)
        }
        Command::Unknown(line) => format!("Unknown request: {}", line),
    }
}

/// Blocking REPL over stdin/stdout. Only entered when the operator passes
/// `--debug-cli` on the command line; never touched on the request path.
pub fn run_repl() {
    let stdin = io::stdin();
    let mut stdout = io::stdout();
    print!("cache_proxy> ");
    let _ = stdout.flush();
    for line in stdin.lock().lines() {
        let Ok(line) = line else { break };
        let line = line.trim();
        if line.is_empty() {
            print!("cache_proxy> ");
            let _ = stdout.flush();
            continue;
        }
        if line == "quit" || line == "exit" {
            break;
        }
        println!("{}", execute(parse(line)));
        print!("cache_proxy> ");
        let _ = stdout.flush();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn xid_show_parses_with_no_argument() {
        assert_eq!(parse("debug.xid"), Command::XidShow);
    }

    #[test]
    fn xid_set_parses_value() {
        assert_eq!(parse("debug.xid 42"), Command::XidSet(42));
    }

    #[test]
    fn srandom_default_seeds_with_one() {
        assert_eq!(parse("debug.srandom"), Command::SrandomDefault);
        execute(Command::SrandomDefault);
        assert_eq!(RANDOM_STATE.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn srandom_set_reseeds_state() {
        execute(parse("debug.srandom 7"));
        assert_eq!(RANDOM_STATE.load(Ordering::Relaxed), 7);
    }

    #[test]
    fn srandom_next_advances_state_deterministically() {
        srandom_seed(1);
        let a = srandom_next();
        srandom_seed(1);
        let b = srandom_next();
        assert_eq!(a, b);
    }

    #[test]
    fn unknown_command_is_reported() {
        match parse("debug.bogus") {
            Command::Unknown(_) => {}
            _ => panic!("expected Unknown"),
        }
    }
}
