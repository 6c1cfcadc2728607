// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

#![allow(clippy::all)]

mod integration_tests {
    pub mod common;

    pub mod backpressure;
    pub mod dlq_redrive;
    pub mod persistent_at_least_once_restart;
}
