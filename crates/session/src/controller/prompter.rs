//! Answers authentication prompts from terminal keystrokes.

use super::terminal::{Inbox, Terminal};
use async_trait::async_trait;
use tracing::debug;
use wisp_platform::{WispError, WispResult};
use wisp_proto::ssh::{AuthPrompter, Prompt};

const ERASE: &[u8] = b"\x08 \x08";

/// Reads prompt answers line by line from descriptor 0.
///
/// Enter ends a line. Ctrl-C or Ctrl-D declines the prompt. Answers are
/// echoed only when the prompt allows it.
pub(crate) struct TerminalPrompter<'a> {
    terminal: &'a mut Terminal,
    inbox: &'a mut Inbox,
}

enum Edit {
    Line(Vec<u8>),
    Cancelled,
}

impl<'a> TerminalPrompter<'a> {
    pub(crate) fn new(terminal: &'a mut Terminal, inbox: &'a mut Inbox) -> Self {
        Self { terminal, inbox }
    }

    async fn read_line(&mut self, echo: bool) -> WispResult<Option<String>> {
        let mut line = Vec::new();
        loop {
            let pending = self.terminal.take_typeahead();
            let (edit, consumed, echoed) = edit_line(&mut line, &pending, echo);
            self.terminal.buffer_input(&pending[consumed..]);
            if !echoed.is_empty() {
                self.terminal.emit(crate::host::STDOUT_FD, echoed, false)?;
            }

            match edit {
                Some(Edit::Line(bytes)) => {
                    self.terminal.print("\n")?;
                    return Ok(Some(String::from_utf8_lossy(&bytes).into_owned()));
                }
                Some(Edit::Cancelled) => {
                    self.terminal.print("\n")?;
                    debug!("Prompt cancelled");
                    return Ok(None);
                }
                None => {}
            }

            let input = self
                .inbox
                .recv()
                .await
                .ok_or_else(|| WispError::ConnectionFailed("control channel closed".into()))?;
            if let Some(keys) = self.terminal.absorb(input)? {
                self.terminal.buffer_input(&keys);
            }
        }
    }
}

/// Applies `input` to `line`. Returns the finished edit if any, the number
/// of input bytes consumed, and the bytes to echo.
fn edit_line(line: &mut Vec<u8>, input: &[u8], echo: bool) -> (Option<Edit>, usize, Vec<u8>) {
    let mut echoed = Vec::new();
    let mut i = 0;
    while i < input.len() {
        let byte = input[i];
        i += 1;
        match byte {
            b'\r' | b'\n' => {
                if byte == b'\r' && input.get(i) == Some(&b'\n') {
                    i += 1;
                }
                return (Some(Edit::Line(std::mem::take(line))), i, echoed);
            }
            0x03 | 0x04 => {
                line.clear();
                return (Some(Edit::Cancelled), i, echoed);
            }
            0x7f | 0x08 => {
                if pop_char(line) && echo {
                    echoed.extend_from_slice(ERASE);
                }
            }
            _ => {
                line.push(byte);
                if echo {
                    echoed.push(byte);
                }
            }
        }
    }
    (None, i, echoed)
}

/// Removes the last UTF-8 character. Returns false if `line` was empty.
fn pop_char(line: &mut Vec<u8>) -> bool {
    let Some(mut last) = line.pop() else {
        return false;
    };
    while last & 0xc0 == 0x80 {
        match line.pop() {
            Some(byte) => last = byte,
            None => break,
        }
    }
    true
}

fn host_display(host: &str, port: u16) -> String {
    if port == crate::params::DEFAULT_PORT {
        host.to_string()
    } else {
        format!("[{}]:{}", host, port)
    }
}

#[async_trait]
impl<'a> AuthPrompter for TerminalPrompter<'a> {
    async fn password(&mut self, user: &str, host: &str) -> WispResult<Option<String>> {
        self.terminal.print(&format!("{}@{}'s password: ", user, host))?;
        self.read_line(false).await
    }

    async fn keyboard_interactive(
        &mut self,
        name: &str,
        instruction: &str,
        prompts: &[Prompt],
    ) -> WispResult<Option<Vec<String>>> {
        for text in [name, instruction] {
            if !text.is_empty() {
                self.terminal.print(&format!("{}\n", text.trim_end()))?;
            }
        }

        let mut answers = Vec::with_capacity(prompts.len());
        for prompt in prompts {
            self.terminal.print(&prompt.text)?;
            match self.read_line(prompt.echo).await? {
                Some(answer) => answers.push(answer),
                None => return Ok(None),
            }
        }
        Ok(Some(answers))
    }

    async fn banner(&mut self, message: &str) -> WispResult<()> {
        self.terminal.print(message)
    }

    async fn confirm_host_key(
        &mut self,
        host: &str,
        port: u16,
        key_type: &str,
        fingerprint: &str,
    ) -> WispResult<bool> {
        self.terminal.print(&format!(
            "The authenticity of host '{}' can't be established.\n{} key fingerprint is {}.\n",
            host_display(host, port),
            key_type,
            fingerprint
        ))?;
        loop {
            self.terminal
                .print("Are you sure you want to continue connecting (yes/no)? ")?;
            let Some(answer) = self.read_line(true).await? else {
                return Ok(false);
            };
            match answer.trim().to_ascii_lowercase().as_str() {
                "yes" => return Ok(true),
                "no" => return Ok(false),
                _ => self.terminal.print("Please type 'yes' or 'no'.\n")?,
            }
        }
    }
}
