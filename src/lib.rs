//! Host-side core of the Modem-Host Interface (MHI) transport: ring
//! primitives, the event-ring processor, the channel and command engines,
//! the channel state machine, and the IRQ/worker glue that ties them to a
//! real interrupt controller.
//!
//! This crate does not know how to enumerate a PCIe device, bind a client
//! driver to a channel, or collect a crash dump; those are the job of
//! whatever embeds it (see the [`controller`] and [`client`] collaborator
//! traits).

#![deny(missing_docs)]

pub mod buffer;
pub mod channel;
pub mod client;
pub mod command;
pub mod controller;
pub mod error;
pub mod event;
pub mod pm;
pub mod register;
pub mod ring;
pub mod state;
pub mod trb;
pub mod worker;
