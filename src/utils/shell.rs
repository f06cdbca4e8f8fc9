//! Shell-safe command construction.
//!
//! Commands are always built as argv vectors and only flattened to a
//! single string with `shlex` quoting at the last moment (tmux takes the
//! initial program of a session as one shell command). Nothing in this
//! module interprets user text as shell.

/// Quote a single argument for POSIX shell.
pub fn quote(arg: &str) -> String {
    shlex::try_quote(arg)
        .map(|q| q.into_owned())
        // Only fails on embedded NUL, which no shell accepts anyway.
        .unwrap_or_else(|_| format!("'{}'", arg.replace('\u{0}', "")))
}

/// Join an argv into a single shell-quoted command string.
pub fn join(argv: &[String]) -> String {
    argv.iter().map(|a| quote(a)).collect::<Vec<_>>().join(" ")
}

/// Wrap a quoted command with a pre-command, e.g. environment setup that
/// must run in the same shell before the tool starts. The tool replaces
/// the wrapper shell so session lifetime still tracks the tool.
pub fn wrap_with_setup(env_setup: &str, command_str: &str) -> String {
    format!("bash -c {}", quote(&format!("{} && exec {}", env_setup, command_str)))
}

/// tmux argv for creating a detached session running `command_str`.
///
/// The command is the session's initial program: when it exits, the
/// session exits, which is how the monitor observes completion.
pub fn tmux_new_session(socket: &str, session: &str, workdir: &str, command_str: &str) -> Vec<String> {
    vec![
        "tmux".into(),
        "-S".into(),
        socket.into(),
        "new-session".into(),
        "-d".into(),
        "-s".into(),
        session.into(),
        "-c".into(),
        workdir.into(),
        command_str.into(),
    ]
}

/// tmux argv for sending literal text (no key-name interpretation).
pub fn tmux_send_literal(socket: &str, session: &str, text: &str) -> Vec<String> {
    vec![
        "tmux".into(),
        "-S".into(),
        socket.into(),
        "send-keys".into(),
        "-t".into(),
        pane_target(session),
        "-l".into(),
        "--".into(),
        text.into(),
    ]
}

/// tmux argv for sending a named key (`Enter`, `BSpace`, ...).
pub fn tmux_send_key(socket: &str, session: &str, key: &str) -> Vec<String> {
    vec![
        "tmux".into(),
        "-S".into(),
        socket.into(),
        "send-keys".into(),
        "-t".into(),
        pane_target(session),
        key.into(),
    ]
}

/// tmux argv for capturing the last `lines` of pane text with wrapped
/// lines joined. Pass `alternate = true` to read the alternate screen.
pub fn tmux_capture_pane(
    socket: &str,
    session: &str,
    lines: u32,
    alternate: bool,
) -> Vec<String> {
    let mut args: Vec<String> = vec![
        "tmux".into(),
        "-S".into(),
        socket.into(),
        "capture-pane".into(),
        "-p".into(),
        "-J".into(),
    ];
    if alternate {
        args.push("-a".into());
    }
    args.extend([
        "-t".into(),
        pane_target(session),
        "-S".into(),
        format!("-{}", lines),
    ]);
    args
}

/// tmux argv for liveness checking (exit 0 iff the session exists).
pub fn tmux_has_session(socket: &str, session: &str) -> Vec<String> {
    vec![
        "tmux".into(),
        "-S".into(),
        socket.into(),
        "has-session".into(),
        "-t".into(),
        session.into(),
    ]
}

/// tmux argv for killing a session.
pub fn tmux_kill_session(socket: &str, session: &str) -> Vec<String> {
    vec![
        "tmux".into(),
        "-S".into(),
        socket.into(),
        "kill-session".into(),
        "-t".into(),
        session.into(),
    ]
}

/// tmux argv for piping the raw pane stream into a log file.
pub fn tmux_pipe_pane(socket: &str, session: &str, log_path: &str) -> Vec<String> {
    vec![
        "tmux".into(),
        "-S".into(),
        socket.into(),
        "pipe-pane".into(),
        "-t".into(),
        pane_target(session),
        format!("cat >> {}", quote(log_path)),
    ]
}

/// The only pane CAM addresses: window 0, pane 0 of the session.
pub fn pane_target(session: &str) -> String {
    format!("{}:0.0", session)
}
