//! Where interactive PAM answers come from.

use std::io::{BufRead, Write};

use crate::error::{Result, TransportError};

/// Prompts the user and reads answers.
pub trait InteractiveInput: Send + Sync {
    fn show_prompt(&self, prompt: &str);

    /// Reads a line that may be echoed.
    fn read_visible(&self) -> Result<String>;

    /// Reads a secret without echo.
    fn read_masked(&self) -> Result<String>;
}

/// Standard input and output of the process.
#[derive(Debug, Clone, Copy, Default)]
pub struct TerminalInput;

impl InteractiveInput for TerminalInput {
    fn show_prompt(&self, prompt: &str) {
        let mut out = std::io::stdout();
        let _ = write!(out, "{}", prompt);
        let _ = out.flush();
    }

    fn read_visible(&self) -> Result<String> {
        let mut line = String::new();
        std::io::stdin().lock().read_line(&mut line)?;
        Ok(line.trim_end_matches(['\r', '\n']).to_string())
    }

    fn read_masked(&self) -> Result<String> {
        rpassword::read_password()
            .map_err(|e| TransportError::auth_flow(format!("failed to read password: {}", e)))
    }
}

/// Answers from a fixed list; used where no terminal is attached.
#[derive(Debug, Default)]
pub struct ScriptedInput {
    answers: std::sync::Mutex<std::collections::VecDeque<String>>,
    prompts: std::sync::Mutex<Vec<String>>,
}

impl ScriptedInput {
    pub fn new<I, S>(answers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            answers: std::sync::Mutex::new(answers.into_iter().map(Into::into).collect()),
            prompts: std::sync::Mutex::new(Vec::new()),
        }
    }

    /// Prompts shown so far.
    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().map(|p| p.clone()).unwrap_or_default()
    }

    fn next_answer(&self) -> Result<String> {
        let mut answers = self
            .answers
            .lock()
            .map_err(|_| TransportError::auth_flow("scripted input poisoned"))?;
        answers
            .pop_front()
            .ok_or_else(|| TransportError::auth_flow("no scripted answer left"))
    }
}

impl InteractiveInput for ScriptedInput {
    fn show_prompt(&self, prompt: &str) {
        if let Ok(mut prompts) = self.prompts.lock() {
            prompts.push(prompt.to_string());
        }
    }

    fn read_visible(&self) -> Result<String> {
        self.next_answer()
    }

    fn read_masked(&self) -> Result<String> {
        self.next_answer()
    }
}
