//! Operator interaction and the confirmation gate guarding destructive actions

use std::{
    future::Future,
    io::{BufRead, BufReader, Write},
    thread,
};
use tokio::sync::mpsc;
use tracing::{info, warn};

/// Word the operator must type to allow deletion
pub const CONFIRM_TOKEN: &str = "yes";

/// Shown in place of a distribution id when none was located
pub const NO_DISTRIBUTION: &str = "N/A (None Found)";

const BANNER_WIDTH: usize = 60;

/// Source of operator input and sink for operator-facing output
pub trait Prompt: Send {
    /// Shows `question` and reads one line, or `None` if input is closed or unreadable
    fn ask(&mut self, question: &str) -> impl Future<Output = Option<String>> + Send;

    /// Shows `text` to the operator
    fn say(&mut self, text: &str);
}

/// A [Prompt] backed by the process's stdin and stdout.
///
/// Lines are read on a dedicated thread outside the runtime's blocking pool, which
/// shutdown does not wait for.
pub struct Terminal {
    lines: mpsc::Receiver<String>,
}

impl Terminal {
    pub fn new() -> Self {
        Self::from_reader(BufReader::new(std::io::stdin()))
    }

    /// Answers questions with lines read from `reader`
    pub fn from_reader<R: BufRead + Send + 'static>(reader: R) -> Self {
        let (sender, lines) = mpsc::channel(1);
        let spawned = thread::Builder::new()
            .name("stdin".into())
            .spawn(move || {
                for line in reader.lines() {
                    let Ok(line) = line else {
                        break;
                    };
                    if sender.blocking_send(line).is_err() {
                        break;
                    }
                }
            });
        if let Err(e) = spawned {
            // The sender is gone with the closure, so every question reads as closed input
            warn!(error = %e, "failed to start input reader");
        }
        Self { lines }
    }
}

impl Default for Terminal {
    fn default() -> Self {
        Self::new()
    }
}

impl Prompt for Terminal {
    async fn ask(&mut self, question: &str) -> Option<String> {
        let mut stdout = std::io::stdout();
        if write!(stdout, "{question}").and_then(|_| stdout.flush()).is_err() {
            return None;
        }
        self.lines.recv().await
    }

    fn say(&mut self, text: &str) {
        println!("{text}");
    }
}

/// Asks `question` and returns the trimmed answer, treating empty or closed input as `None`
pub async fn ask_trimmed<P: Prompt>(prompt: &mut P, question: &str) -> Option<String> {
    prompt
        .ask(question)
        .await
        .map(|answer| answer.trim().to_string())
        .filter(|answer| !answer.is_empty())
}

/// Shows the resources about to be deleted and returns whether the operator typed
/// [CONFIRM_TOKEN].
///
/// Any other answer, including an empty line or a closed input stream, is a refusal.
pub async fn confirm<P: Prompt>(prompt: &mut P, bucket: &str, distribution: Option<&str>) -> bool {
    let rule = "=".repeat(BANNER_WIDTH);
    prompt.say(&format!(
        "\n{rule}\n!!! WARNING: RESOURCE DELETION !!!\n{rule}\n\
         You are about to permanently delete the following AWS resources:\n  \
         - S3 Bucket:          {bucket}\n  \
         - CloudFront Distro:  {}\n\n\
         THIS ACTION CANNOT BE UNDONE.\n{rule}",
        distribution.unwrap_or(NO_DISTRIBUTION)
    ));

    let Some(answer) = prompt
        .ask(&format!("Type '{CONFIRM_TOKEN}' to confirm deletion: "))
        .await
    else {
        warn!("input stream closed, deletion cancelled");
        return false;
    };
    if answer.trim().to_lowercase() == CONFIRM_TOKEN {
        info!(bucket, ?distribution, "operator confirmed deletion");
        return true;
    }
    warn!("deletion cancelled by operator");
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aws::mocks::ScriptedPrompt;
    use std::time::Duration;
    use test_case::test_case;

    #[test_case("yes", true; "exact")]
    #[test_case("  yes\n", true; "surrounding_whitespace")]
    #[test_case("YES", true; "uppercase")]
    #[test_case("y", false; "abbreviation")]
    #[test_case("no", false; "refusal")]
    #[test_case("", false; "empty")]
    #[test_case("yes please", false; "extra_words")]
    #[tokio::test]
    async fn test_confirm_answers(answer: &str, expected: bool) {
        let mut prompt = ScriptedPrompt::new([answer]);
        assert_eq!(confirm(&mut prompt, "site-abc", Some("E123")).await, expected);
    }

    #[tokio::test]
    async fn test_confirm_closed_input() {
        let mut prompt = ScriptedPrompt::closed();
        assert!(!confirm(&mut prompt, "site-abc", None).await);
    }

    #[tokio::test]
    async fn test_confirm_lists_resources() {
        let mut prompt = ScriptedPrompt::new(["no"]);
        confirm(&mut prompt, "site-abc", Some("E123")).await;
        let transcript = prompt.transcript();
        assert!(transcript.contains("S3 Bucket:          site-abc"));
        assert!(transcript.contains("CloudFront Distro:  E123"));
    }

    #[tokio::test]
    async fn test_confirm_without_distribution() {
        let mut prompt = ScriptedPrompt::new(["no"]);
        confirm(&mut prompt, "site-abc", None).await;
        assert!(prompt
            .transcript()
            .contains("CloudFront Distro:  N/A (None Found)"));
    }

    #[tokio::test]
    async fn test_terminal_reads_lines() {
        let mut terminal = Terminal::from_reader(std::io::Cursor::new("site-abc\nyes\n"));
        assert_eq!(terminal.ask("bucket? ").await.as_deref(), Some("site-abc"));
        assert_eq!(terminal.ask("confirm? ").await.as_deref(), Some("yes"));
        assert_eq!(terminal.ask("more? ").await, None);
    }

    /// A reader whose next line never arrives
    struct Silent;

    impl std::io::Read for Silent {
        fn read(&mut self, _: &mut [u8]) -> std::io::Result<usize> {
            loop {
                thread::park();
            }
        }
    }

    #[test]
    fn test_pending_read_does_not_block_shutdown() {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .build()
            .unwrap();
        let answer = runtime.block_on(async {
            let mut terminal = Terminal::from_reader(BufReader::new(Silent));
            tokio::time::timeout(Duration::from_millis(50), terminal.ask("confirm? ")).await
        });
        assert!(answer.is_err());

        let start = std::time::Instant::now();
        drop(runtime);
        assert!(start.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_ask_trimmed() {
        let mut prompt = ScriptedPrompt::new(["  eu-west-1 ", "   "]);
        assert_eq!(
            ask_trimmed(&mut prompt, "region? ").await.as_deref(),
            Some("eu-west-1")
        );
        assert_eq!(ask_trimmed(&mut prompt, "region? ").await, None);
        assert_eq!(ask_trimmed(&mut prompt, "region? ").await, None);
    }
}
