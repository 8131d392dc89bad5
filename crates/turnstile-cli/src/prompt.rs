use dialoguer::Select;
use std::io::IsTerminal;
use tracing::warn;
use turnstile_core::permission::{Choice, Confirm, Prompt};

/// Arrow-key picker on the controlling terminal. Without a terminal on
/// stderr nobody can answer, so the gate blocks instead.
pub struct TerminalConfirm;

impl Confirm for TerminalConfirm {
    fn is_interactive(&self) -> bool {
        std::io::stderr().is_terminal()
    }

    fn choose(&self, prompt: &Prompt) -> Option<Choice> {
        let items: Vec<String> = prompt.choices.iter().map(|c| c.to_string()).collect();
        let default = prompt
            .choices
            .iter()
            .position(|c| *c == Choice::Block)
            .unwrap_or(0);
        match Select::new()
            .with_prompt(format!("{}\n  {}", prompt.title, prompt.message))
            .items(&items)
            .default(default)
            .interact_opt()
        {
            Ok(picked) => picked.and_then(|i| prompt.choices.get(i).copied()),
            Err(e) => {
                warn!(error = %e, "prompt failed; blocking");
                None
            }
        }
    }
}
