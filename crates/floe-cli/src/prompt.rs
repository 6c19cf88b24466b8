use std::io::{self, BufRead, IsTerminal, Write};

/// Ask for a typed confirmation word on stderr. Non-interactive input is
/// refused so scripts have to pass `--yes`.
pub(crate) fn confirm(question: &str, word: &str) -> io::Result<bool> {
    let stdin = io::stdin();
    if !stdin.is_terminal() {
        return Err(io::Error::new(
            io::ErrorKind::Other,
            "refusing to continue without confirmation in non-interactive mode; use --yes",
        ));
    }
    eprint!("{question} Type '{word}' to confirm: ");
    io::stderr().flush()?;

    let mut line = String::new();
    stdin.lock().read_line(&mut line)?;
    Ok(line.trim() == word)
}
