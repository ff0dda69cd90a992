// Master core: formats the arena, announces a stream and pushes audio blocks to the DSP core.
//
//   cargo run --example host_core -- <num_blocks>
//   cargo run --example dsp_core          (in a second terminal)
use audio_ipc::IPC::envelope::{AudioBlock, Envelope};
use audio_ipc::IPC::{CoreBuilder, IpcContext, MsgBuffer, StreamConfig};
use sha2::{Digest, Sha256};
use std::env;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

const SHM_NAME: &str = "aeipc_demo";
const DSP_CORE: u8 = 1;
const CHANNELS: u8 = 2;
const FRAMES: u8 = 64;

fn block_digest(data: &[i32]) -> String {
    let mut hasher = Sha256::new();
    for sample in data {
        hasher.update(sample.to_le_bytes());
    }
    format!("{:x}", hasher.finalize())
}

fn main() -> audio_ipc::Result<()> {
    env_logger::init();

    let args: Vec<String> = env::args().collect();
    let num_blocks: usize = match args.get(1).map(|s| s.parse()) {
        Some(Ok(n)) => n,
        _ => {
            eprintln!("Usage: {} <num_blocks>", args[0]);
            std::process::exit(1);
        }
    };

    let running = Arc::new(AtomicBool::new(true));
    let running_for_handler = Arc::clone(&running);
    ctrlc::set_handler(move || {
        running_for_handler.store(false, Ordering::SeqCst);
    })
    .expect("Error setting Ctrl+C handler");

    let ctx = CoreBuilder::new()
        .with_core_index(0)
        .with_master(true)
        .with_shm_name(SHM_NAME)
        .build()?;

    ctx.register_receive_callback(|ctx: &IpcContext, msg: MsgBuffer| {
        match Envelope::decode(&msg.read_payload(ctx.arena())) {
            Ok(Envelope::Cycles(c)) => println!("Host: core {} used {} cycles", c.core, c.cycles),
            Ok(other) => println!("Host: unexpected {:?}", other.msg_type()),
            Err(e) => eprintln!("Host: {}", e),
        }
        if let Err(e) = ctx.unref_buffer(msg) {
            log::error!("core {}: releasing a received buffer failed: {}", ctx.core_index(), e);
        }
    });

    let stream = ctx.register_stream(&StreamConfig::new("host_out").channels(CHANNELS).block_size(FRAMES as u32))?;
    println!("Host: registered stream id {}, waiting for core {}", stream.stream_id(), DSP_CORE);

    while running.load(Ordering::SeqCst) && !ctx.is_core_ready(DSP_CORE) {
        ctx.wait_for_interrupt(Some(Duration::from_millis(100)));
    }

    let start = std::time::Instant::now();
    let mut sent = 0;
    while running.load(Ordering::SeqCst) && sent < num_blocks {
        let data: Vec<i32> = (0..CHANNELS as i32 * FRAMES as i32)
            .map(|i| i * sent as i32)
            .collect();
        let digest = block_digest(&data);
        let envelope = Envelope::Audio(AudioBlock {
            stream_id: stream.stream_id(),
            num_channels: CHANNELS,
            num_frames: FRAMES,
            word_size: 4,
            data,
        });
        let msg = ctx.create_msg_buffer_from(&envelope.encode()?)?;
        match ctx.send(msg, DSP_CORE, true) {
            Ok(()) => {
                sent += 1;
                println!("Host: block {} sha256 {}", sent, &digest[..16]);
            }
            Err(e) if e.error.is_recoverable() => {
                // Ring full or DSP core restarting: retry once it has drained
                ctx.unref_buffer(e.into_inner())?;
                ctx.wait_for_interrupt(Some(Duration::from_millis(1)));
            }
            Err(e) => {
                let error = e.to_string();
                ctx.unref_buffer(e.into_inner())?;
                return Err(audio_ipc::IpcError::Error(error));
            }
        }
        ctx.service_interrupt();
    }

    println!("Host: sent {} blocks in {:.2?}", sent, start.elapsed());
    while running.load(Ordering::SeqCst) && ctx.pending() > 0 {
        ctx.service_interrupt();
    }
    ctx.unregister_stream(stream)?;
    println!("Host: heap {:?}", ctx.heap_info()?);
    drop(ctx);
    audio_ipc::Core::unlink_shared_memory(SHM_NAME)?;
    Ok(())
}
