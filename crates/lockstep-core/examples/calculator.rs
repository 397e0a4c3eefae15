//! Drive a line-oriented calculator as if it were a function call.
//!
//! The shell loop reads one expression per line and answers with its value;
//! each `write`/`recv` pair below is one complete request/response turn.
//!
//! Run with: `cargo run --example calculator`

use std::time::Duration;

use lockstep_core::Session;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let mut session = Session::new();
    session.spawn(&[
        "/bin/sh",
        "-c",
        "while read expr; do echo $((expr)); done",
    ])?;

    for expr in ["2+2", "6*7", "(10-1)*3"] {
        session.write(format!("{expr}\n").as_bytes());
        let answer = session
            .recv(Some(Duration::from_secs(5)))?
            .unwrap_or_default();
        println!("{expr} = {}", String::from_utf8_lossy(&answer).trim());
    }

    session.close()?;
    Ok(())
}
