//! Host-argument inheritance for child workers.
//!
//! The host argv is treated as an injected read-only slice so the selection
//! logic stays pure and testable. Debug-oriented flags are propagated to
//! child processes; `--inspect` is rewritten to the configured debug port so
//! every worker gets its own inspector endpoint.

/// Flags inherited verbatim when present on the host argv.
const INHERITED_EXACT: &[&str] = &["--debug-brk"];

/// Flag prefixes inherited verbatim when present on the host argv.
const INHERITED_PREFIXES: &[&str] = &["--max-old-space-size="];

/// Extracts the inheritable flags from `host_argv`.
///
/// `--inspect` and `--inspect=<port>` are rewritten to `--inspect=<debug_port>`
/// when a debug port is configured; other recognised flags pass through
/// unchanged. Everything else is dropped.
pub(crate) fn inherited_exec_args(host_argv: &[String], debug_port: Option<u16>) -> Vec<String> {
    let mut args = Vec::new();
    for arg in host_argv {
        if arg.starts_with("--inspect") {
            match debug_port {
                Some(port) => args.push(format!("--inspect={port}")),
                None => args.push(arg.clone()),
            }
        } else if INHERITED_EXACT.contains(&arg.as_str())
            || INHERITED_PREFIXES.iter().any(|p| arg.starts_with(p))
        {
            args.push(arg.clone());
        }
    }
    args
}

/// The real host argv (program name excluded), used when no slice is injected.
pub(crate) fn host_argv() -> Vec<String> {
    std::env::args().skip(1).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn argv(args: &[&str]) -> Vec<String> {
        args.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_unrelated_flags_are_dropped() {
        let args = inherited_exec_args(&argv(&["serve", "--port=8080", "-v"]), None);
        assert!(args.is_empty());
    }

    #[test]
    fn test_inspect_rewritten_to_debug_port() {
        let args = inherited_exec_args(&argv(&["--inspect=9229"]), Some(40000));
        assert_eq!(args, argv(&["--inspect=40000"]));
    }

    #[test]
    fn test_inspect_kept_without_debug_port() {
        let args = inherited_exec_args(&argv(&["--inspect"]), None);
        assert_eq!(args, argv(&["--inspect"]));
    }

    #[test]
    fn test_inspect_brk_variant_is_rewritten() {
        let args = inherited_exec_args(&argv(&["--inspect-brk=9229"]), Some(41000));
        assert_eq!(args, argv(&["--inspect=41000"]));
    }

    #[test]
    fn test_debug_brk_and_heap_flags_pass_through() {
        let args = inherited_exec_args(
            &argv(&["--debug-brk", "--max-old-space-size=4096", "other"]),
            Some(9229),
        );
        assert_eq!(args, argv(&["--debug-brk", "--max-old-space-size=4096"]));
    }
}
