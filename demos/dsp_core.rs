// Worker core: attaches to the host's arena and answers every audio block with a cycle count.
use audio_ipc::IPC::envelope::{Cycles, Envelope};
use audio_ipc::IPC::{CoreBuilder, IpcContext, IpcEvent, MsgBuffer, StreamChange};
use sha2::{Digest, Sha256};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

const SHM_NAME: &str = "aeipc_demo";
const HOST_CORE: u8 = 0;

fn main() -> audio_ipc::Result<()> {
    env_logger::init();

    let running = Arc::new(AtomicBool::new(true));
    let running_for_handler = Arc::clone(&running);
    ctrlc::set_handler(move || {
        running_for_handler.store(false, Ordering::SeqCst);
    })
    .expect("Error setting Ctrl+C handler");

    let ctx = CoreBuilder::attach(1).with_shm_name(SHM_NAME).build()?;
    println!("DSP: attached as core {}", ctx.core_index());

    ctx.register_event_callback(|_: &IpcContext, event: &IpcEvent<'_>| match event.stream_change() {
        Some(StreamChange::Added(info)) => println!("DSP: stream '{}' added by core {}", info.name(), info.owner_core),
        Some(StreamChange::Removed(info)) => println!("DSP: stream '{}' removed", info.name()),
        None => println!("DSP: event {} from core {}", event.tag, event.source_core),
    });

    ctx.register_receive_callback(|ctx: &IpcContext, msg: MsgBuffer| {
        let started = Instant::now();
        let decoded = Envelope::decode(&msg.read_payload(ctx.arena()));
        if let Err(e) = ctx.unref_buffer(msg) {
            log::error!("core {}: releasing a received buffer failed: {}", ctx.core_index(), e);
        }

        let block = match decoded {
            Ok(Envelope::Audio(block)) => block,
            Ok(other) => return println!("DSP: ignoring {:?}", other.msg_type()),
            Err(e) => return eprintln!("DSP: {}", e),
        };
        let mut hasher = Sha256::new();
        for sample in &block.data {
            hasher.update(sample.to_le_bytes());
        }
        let digest = format!("{:x}", hasher.finalize());
        println!(
            "DSP: stream {} block of {}x{} sha256 {}",
            block.stream_id,
            block.num_channels,
            block.num_frames,
            &digest[..16]
        );

        let reply = Envelope::Cycles(Cycles {
            core: ctx.core_index(),
            cycles: started.elapsed().as_nanos() as u32,
        });
        let sent = reply
            .encode()
            .and_then(|bytes| ctx.send_bytes(&bytes, HOST_CORE, true));
        if let Err(e) = sent {
            eprintln!("DSP: reply failed: {}", e);
        }
    });

    while running.load(Ordering::SeqCst) {
        ctx.wait_for_interrupt(Some(Duration::from_millis(100)));
    }
    println!("DSP: heap check {}", if ctx.check_heap() { "ok" } else { "FAILED" });
    Ok(())
}
