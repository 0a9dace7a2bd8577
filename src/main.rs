mod cli;

use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use cli::Cli;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use mhi_host_core::buffer::{Buffer, BufferMapper, DirectMapper, Direction, IommuMapper};
use mhi_host_core::channel::Channel;
use mhi_host_core::client::Client;
use mhi_host_core::command::CommandEngine;
use mhi_host_core::controller::Controller;
use mhi_host_core::event::EventRingProcessor;
use mhi_host_core::pm::{PmState, StaticPm};
use mhi_host_core::register::{Doorbell, DoorbellMode, FakeRegisterFile};
use mhi_host_core::ring::Ring;
use mhi_host_core::state::ChannelCommand;
use mhi_host_core::trb::{EventCode, EventElement, EventKind};

/// A bump-pointer stand-in for a real platform IOMMU mapping.
struct BumpIommu {
    next: u64,
}

impl IommuMapper for BumpIommu {
    fn map(&mut self, len: usize, _direction: Direction) -> mhi_host_core::error::MhiResult<u64> {
        let addr = self.next;
        self.next += len as u64;
        Ok(addr)
    }

    fn unmap(&mut self, _device_ptr: u64, _len: usize) {}
}

/// Logs every completion it sees; stands in for a real channel's protocol
/// driver in this loopback demo.
struct LoggingClient {
    channel_id: u32,
}

impl Client for LoggingClient {
    fn on_transfer_complete(
        &mut self,
        channel_id: u32,
        code: mhi_host_core::trb::EventCode,
        transferred_len: u32,
        buffer: Buffer,
    ) {
        info!(
            channel_id,
            ?code,
            transferred_len,
            client_token = buffer.client_token,
            "transfer complete"
        );
    }

    fn on_state_change(&mut self, channel_id: u32, new_state: mhi_host_core::state::ChannelState) {
        info!(channel_id, ?new_state, "channel state changed");
    }
}

fn main() -> Result<()> {
    let args = Cli::parse();

    let subscriber = FmtSubscriber::builder()
        .with_max_level(match args.verbose {
            0 => Level::INFO,
            1 => Level::DEBUG,
            _ => Level::TRACE,
        })
        .finish();
    tracing::subscriber::set_global_default(subscriber).context("failed to set global tracing subscriber")?;

    info!("starting MHI host core loopback demo");

    let command = CommandEngine::new(Ring::new("cmd", 8, 0x6000), Doorbell::new(0x80, DoorbellMode::Disabled));
    let ctrl_events = EventRingProcessor::new(
        Ring::new("ctrl-ev", 8, 0x7000),
        Doorbell::new(0xa0, DoorbellMode::Disabled),
        0xb0,
    );
    let data_events = EventRingProcessor::new(
        Ring::new("data-ev", 8, 0x7800),
        Doorbell::new(0xc0, DoorbellMode::Disabled),
        0xd0,
    );
    let mut controller = Controller::new(command, ctrl_events, data_events, Box::new(StaticPm(PmState::M0)));

    let mapper: Box<dyn BufferMapper> = Box::new(DirectMapper::new(Box::new(BumpIommu { next: 0x9000 })));
    let channel_id = 1;
    let channel = Channel::new(
        channel_id,
        Ring::new("chan1", 8, 0x5000),
        mapper,
        Doorbell::new(0x200, DoorbellMode::Disabled),
        false,
    );
    controller.add_channel(channel, Box::new(LoggingClient { channel_id }));

    let regs = FakeRegisterFile::new(0x2000);
    let timeout = Duration::from_millis(100);

    // Drive the channel through the command ring and its completion event,
    // the way a real device round trip works, rather than poking the
    // channel's state machine directly.
    let cmd_ptr = controller.begin_channel_command(&regs, channel_id, ChannelCommand::Start)?;
    controller.post_control_event(
        &regs,
        EventElement {
            kind: EventKind::CmdCompletion,
            code: EventCode::Success,
            channel_id: 0,
            pointer: cmd_ptr,
            length: 0,
        },
    )?;
    controller.poll_control_events(&regs, 16)?;
    controller.finish_channel_command(&regs, channel_id, ChannelCommand::Start, timeout)?;

    for i in 0..args.count {
        let buf = Buffer::new(vec![i as u8; 16], Direction::ToDevice, i as u64);
        let ptr = controller.submit(&regs, channel_id, buf, 0)?;
        // loop back immediately: a real modem would post this event itself.
        controller.post_data_event(
            &regs,
            EventElement {
                kind: EventKind::Tx,
                code: EventCode::Eot,
                channel_id,
                pointer: ptr,
                length: 16,
            },
        )?;
        controller.poll_data_events(&regs, 16)?;
    }

    info!("demo complete");
    Ok(())
}
