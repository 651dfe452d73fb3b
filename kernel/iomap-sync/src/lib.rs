//! # Synchronization primitives for the remapping code

#![cfg_attr(not(any(test, doctest)), no_std)]

mod ticket_lock;

pub use ticket_lock::{TicketLock, TicketLockGuard};
