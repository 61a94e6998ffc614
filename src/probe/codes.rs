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

//! The RFC 5321 reply codes the probe expects to encounter.
//!
//! This module is designed to be wildcard-imported. The `pc` module allows
//! imports of the form `use codes::pc::*` to make the code values
//! accessible with minimal syntax.

#![allow(dead_code)]

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u16)]
pub enum PrimaryCode {
    ServiceReady = 220,
    ServiceClosing = 221,
    Ok = 250,
    StartMailInput = 354,
    ServiceNotAvailableClosing = 421,
    ActionNotTakenTemporary = 450,
    ActionAborted = 451,
    InsufficientStorage = 452,
    CommandSyntaxError = 500,
    ParameterSyntaxError = 501,
    CommandNotImplemented = 502,
    BadSequenceOfCommands = 503,
    ActionNotTakenPermanent = 550,
    UserNotLocal = 551,
    ExceededStorageAllocation = 552,
    MailboxNameNotAllowed = 553,
    TransactionFailed = 554,
}

pub mod pc {
    pub use super::PrimaryCode::*;
}
