use std::io::{self, Write};

use crossterm::{
    cursor, queue,
    style::{Color, Print, ResetColor, SetForegroundColor},
    terminal::{self, ClearType},
};

use crate::function_calling::{FunctionCall, FunctionResponse};
use crate::stats::StatsReport;

const PROMPT: &str = ">>> ";

/// Operator-facing output. Styled mode adds colors and clears the screen
/// on start; plain mode writes the text only.
pub struct Console<W: Write> {
    out: W,
    styled: bool,
    at_line_start: bool,
}

impl<W: Write> Console<W> {
    pub fn plain(out: W) -> Self {
        Self {
            out,
            styled: false,
            at_line_start: true,
        }
    }

    pub fn styled(out: W) -> Self {
        Self {
            styled: true,
            ..Self::plain(out)
        }
    }

    pub fn get_ref(&self) -> &W {
        &self.out
    }

    pub fn banner(&mut self, backend: &str, tool_count: usize) -> io::Result<()> {
        if self.styled {
            queue!(self.out, terminal::Clear(ClearType::All), cursor::MoveTo(0, 0))?;
        }
        self.colored(Color::Cyan, &format!("MCP Chat ({})\n", backend))?;
        self.colored(Color::Cyan, "===============\n")?;
        self.colored(
            Color::DarkGrey,
            &format!(
                "{} tools available. Type \"stats\" for statistics, \"quit\" to exit.\n\n",
                tool_count
            ),
        )?;
        self.out.flush()
    }

    pub fn prompt(&mut self) -> io::Result<()> {
        self.colored(Color::Cyan, PROMPT)?;
        self.at_line_start = false;
        self.out.flush()
    }

    /// Write a streamed fragment exactly as received.
    pub fn fragment(&mut self, text: &str) -> io::Result<()> {
        if text.is_empty() {
            return Ok(());
        }
        self.out.write_all(text.as_bytes())?;
        self.at_line_start = text.ends_with('\n');
        self.out.flush()
    }

    /// Finish the current response line.
    pub fn end_response(&mut self) -> io::Result<()> {
        self.break_line()?;
        self.out.flush()
    }

    pub fn tool_call(&mut self, call: &FunctionCall) -> io::Result<()> {
        self.break_line()?;
        self.colored(Color::Yellow, &format!("🔧 {}({})\n", call.name, call.args))?;
        self.out.flush()
    }

    pub fn tool_result(&mut self, response: &FunctionResponse) -> io::Result<()> {
        self.break_line()?;
        if response.is_error {
            self.colored(Color::Red, &format!("   ↳ {}\n", response.content))?;
        } else {
            self.colored(Color::DarkGrey, &format!("   ↳ {} ok\n", response.name))?;
        }
        self.out.flush()
    }

    pub fn notice(&mut self, text: &str) -> io::Result<()> {
        self.break_line()?;
        self.colored(Color::DarkGrey, &format!("[{}]\n", text))?;
        self.out.flush()
    }

    pub fn error(&mut self, text: &str) -> io::Result<()> {
        self.break_line()?;
        self.colored(Color::Red, &format!("{}\n", text))?;
        self.out.flush()
    }

    pub fn stats(&mut self, report: &StatsReport) -> io::Result<()> {
        self.break_line()?;
        self.colored(Color::Green, &report.to_string())?;
        self.out.flush()
    }

    fn break_line(&mut self) -> io::Result<()> {
        if !self.at_line_start {
            self.out.write_all(b"\n")?;
            self.at_line_start = true;
        }
        Ok(())
    }

    fn colored(&mut self, color: Color, text: &str) -> io::Result<()> {
        if self.styled {
            queue!(self.out, SetForegroundColor(color), Print(text), ResetColor)?;
        } else {
            self.out.write_all(text.as_bytes())?;
        }
        self.at_line_start = text.ends_with('\n');
        Ok(())
    }
}
