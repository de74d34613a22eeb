//! Default worker payload for the process substrate.
//!
//! Speaks the wire protocol over stdio: sends `"ready"` on startup, answers
//! the built-in diagnostic methods plus the `methods` RPC, and exits on the
//! termination signal. Worker executables with custom method sets should
//! build their own registry and call [`offload::worker::run_stdio`].

use offload::worker::run_stdio;
use offload::MethodRegistry;

fn main() -> std::io::Result<()> {
    run_stdio(MethodRegistry::builtin())
}
