//! User interaction operations (confirmation prompts, terminal detection).

use anyhow::Result;

use super::RealRuntime;

use std::io::{self, BufRead, IsTerminal, Write};

/// Reads one answer from `input` after writing the prompt to `output`.
pub(crate) fn confirm_with_io<R: BufRead, W: Write>(prompt: &str, input: &mut R, output: &mut W) -> Result<bool> {
    write!(output, "{} [y/N] ", prompt)?;
    output.flush()?;

    let mut line = String::new();
    input.read_line(&mut line)?;

    let response = line.trim().to_lowercase();
    Ok(response == "y" || response == "yes")
}

impl RealRuntime {
    pub(crate) fn is_interactive_impl(&self) -> bool {
        io::stdin().is_terminal()
    }

    pub(crate) fn confirm_impl(&self, prompt: &str) -> Result<bool> {
        let stdin = io::stdin();
        let mut stdout = io::stdout();
        let mut stdin_lock = stdin.lock();
        confirm_with_io(prompt, &mut stdin_lock, &mut stdout)
    }
}

#[cfg(test)]
mod tests {
    use super::confirm_with_io;
    use anyhow::Result;
    use std::io::Cursor;

    #[test]
    fn confirms_yes_and_short_y() -> Result<()> {
        for case in ["y\n", "Y\n", "yes\n", " YES \n"] {
            let mut input = Cursor::new(case.as_bytes());
            let mut output = Vec::new();
            let ok = confirm_with_io("Remove 3 packages?", &mut input, &mut output)?;
            assert!(ok, "expected '{}' to be accepted as yes", case);
        }
        Ok(())
    }

    #[test]
    fn rejects_anything_else() -> Result<()> {
        for case in ["n\n", "no\n", "\n", "", "yeah\n"] {
            let mut input = Cursor::new(case.as_bytes());
            let mut output = Vec::new();
            let ok = confirm_with_io("Remove?", &mut input, &mut output)?;
            assert!(!ok, "expected '{}' to be rejected", case);
            assert_eq!(String::from_utf8(output)?, "Remove? [y/N] ");
        }
        Ok(())
    }
}
