//! Single-letter operator commands read from standard input.

use std::io::BufRead;

use tokio::sync::mpsc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// Toggle ingestion pause.
    Pause,
    /// Drop every device record.
    Clear,
    ExportJson,
    ExportKml,
    Quit,
}

impl Command {
    /// `p`, `c`, `e`, `k`, `q` (case-insensitive, surrounding blanks ignored).
    pub fn parse(line: &str) -> Option<Command> {
        match line.trim().to_ascii_lowercase().as_str() {
            "p" => Some(Command::Pause),
            "c" => Some(Command::Clear),
            "e" => Some(Command::ExportJson),
            "k" => Some(Command::ExportKml),
            "q" => Some(Command::Quit),
            _ => None,
        }
    }
}

pub const HELP: &str = "commands: p = pause/resume, c = clear, e = export JSON, k = export KML, q = quit";

/// Read commands from `input` on a dedicated thread and forward them.
///
/// The thread ends at end of input or once the receiver is dropped. Blocking
/// reads keep it off the runtime so shutdown never waits on the terminal.
pub fn spawn_reader<R>(input: R, commands: mpsc::Sender<Command>) -> std::io::Result<()>
where
    R: BufRead + Send + 'static,
{
    std::thread::Builder::new()
        .name("blemon-commands".into())
        .spawn(move || forward(input, &commands))?;
    Ok(())
}

fn forward<R: BufRead>(input: R, commands: &mpsc::Sender<Command>) {
    for line in input.lines() {
        let Ok(line) = line else {
            break;
        };
        match Command::parse(&line) {
            Some(cmd) => {
                if commands.blocking_send(cmd).is_err() {
                    break;
                }
            }
            None if line.trim().is_empty() => {}
            None => tracing::info!(input = %line.trim(), "{HELP}"),
        }
    }
    tracing::debug!("Command input closed");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse() {
        assert_eq!(Command::parse("p"), Some(Command::Pause));
        assert_eq!(Command::parse(" C \n"), Some(Command::Clear));
        assert_eq!(Command::parse("e"), Some(Command::ExportJson));
        assert_eq!(Command::parse("k"), Some(Command::ExportKml));
        assert_eq!(Command::parse("Q"), Some(Command::Quit));
        assert_eq!(Command::parse("quit"), None);
        assert_eq!(Command::parse(""), None);
    }

    #[tokio::test]
    async fn test_reader_forwards_known_commands() {
        let (tx, mut rx) = mpsc::channel(8);
        let input = std::io::Cursor::new(b"p\n\nhelp\nk\nq\n".to_vec());
        spawn_reader(input, tx).unwrap();

        let mut got = Vec::new();
        while let Some(cmd) = rx.recv().await {
            got.push(cmd);
        }
        assert_eq!(got, vec![Command::Pause, Command::ExportKml, Command::Quit]);
    }
}
