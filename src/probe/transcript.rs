//-
// Copyright (c) 2026, Jason Lingle
//
// This file is part of Smtprobe.
//
// Smtprobe is free software: you can redistribute it and/or modify it under
// the terms of the GNU General Public License as published by the Free
// Software Foundation, either version 3 of the License, or (at your option)
// any later version.
//
// Smtprobe is distributed in the hope that it will be useful, but WITHOUT ANY
// WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS
// FOR A PARTICULAR PURPOSE. See the GNU General Public License for more
// details.
//
// You should have received a copy of the GNU General Public License along
// with Smtprobe. If not, see <http://www.gnu.org/licenses/>.

use std::fmt;

use chrono::prelude::*;

/// A timestamped record of everything that happened in one probe session.
///
/// The transcript is what the operator sees when a delivery fails, so each
/// command, reply, and TLS event gets a line. Lines after the first carry
/// the delta from the previous entry so that a slow exchange is visible at
/// a glance.
pub struct Transcript {
    lines: Vec<String>,
    last_entry: Option<DateTime<Utc>>,
}

impl Transcript {
    pub fn new() -> Self {
        Transcript {
            lines: Vec::new(),
            last_entry: None,
        }
    }

    pub fn line(&mut self, args: fmt::Arguments<'_>) {
        let now = Utc::now();
        let now_fmt = now.format("%Y-%m-%d %H:%M:%S");
        if let Some(last_entry) = self.last_entry {
            let delta_ms =
                now.signed_duration_since(last_entry).num_milliseconds();
            self.lines.push(format!("{now_fmt} ({delta_ms:+5}ms) {args}"));
        } else {
            self.lines.push(format!("{now_fmt} {args}"));
        }
        self.last_entry = Some(now);
    }

    pub fn lines(&self) -> &[String] {
        &self.lines
    }
}

impl Default for Transcript {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for Transcript {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for line in &self.lines {
            writeln!(f, "{line}")?;
        }
        Ok(())
    }
}
