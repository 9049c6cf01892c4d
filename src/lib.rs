// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! A userspace TCP/IP stack. The stack is agnostic of the host kernel's
//! networking: it consumes raw IP frames from a link endpoint (typically a
//! TUN device) and emits raw IP frames back. Embedders attach link
//! endpoints, assign addresses, install routes, and open transport
//! endpoints through [`inetstack::Stack`].

#[macro_use]
extern crate log;

pub mod inetstack;
pub mod runtime;

//======================================================================================================================
// Test Macros
//======================================================================================================================

/// Ensures that two expressions are equal, bailing out of the enclosing test otherwise.
#[macro_export]
macro_rules! ensure_eq {
    ($left:expr, $right:expr) => {{
        match (&$left, &$right) {
            (left_val, right_val) => {
                if !(*left_val == *right_val) {
                    ::anyhow::bail!(
                        "ensure_eq!({}, {}) failed, left: {:?}, right: {:?}",
                        stringify!($left),
                        stringify!($right),
                        left_val,
                        right_val
                    );
                }
            },
        }
    }};
}

/// Ensures that two expressions are not equal, bailing out of the enclosing test otherwise.
#[macro_export]
macro_rules! ensure_neq {
    ($left:expr, $right:expr) => {{
        match (&$left, &$right) {
            (left_val, right_val) => {
                if *left_val == *right_val {
                    ::anyhow::bail!(
                        "ensure_neq!({}, {}) failed, left: {:?}, right: {:?}",
                        stringify!($left),
                        stringify!($right),
                        left_val,
                        right_val
                    );
                }
            },
        }
    }};
}
