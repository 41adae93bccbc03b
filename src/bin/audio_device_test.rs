use livetutor::device::{AudioBackend, InputDevice, OutputDevice};
use livetutor::pcm::{PlayableBuffer, INPUT_SAMPLE_RATE, OUTPUT_SAMPLE_RATE};
use livetutor::pulse::{list_sources, PulseBackend, PulseMicrophone};
use std::error::Error;
use std::time::Duration;

const PROBE_FRAME: usize = 1600;

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    // Initialize logging
    tracing_subscriber::fmt::init();

    println!("Available audio input devices:");
    let sources = match list_sources() {
        Ok(sources) => sources,
        Err(e) => {
            println!("Error listing devices: {}", e);
            Vec::new()
        }
    };
    if sources.is_empty() {
        println!("No audio devices found!");
    }
    for (i, source) in sources.iter().enumerate() {
        println!(
            "{}: {} ({})",
            i + 1,
            source.description,
            if source.is_monitor { "Monitor" } else { "Microphone" }
        );
        println!("   Name: {}", source.name);
        println!("   Rate: {} Hz, Channels: {}", source.sample_rate, source.channels);
        println!();
    }

    println!("\nTesting default microphone...");
    let mut backend = PulseBackend::new("livetutor-test");
    match backend.open_input(INPUT_SAMPLE_RATE) {
        Ok(mut mic) => {
            probe_microphone(mic.as_mut()).await;
            mic.stop();
        }
        Err(e) => println!("Failed to open default microphone: {}", e),
    }

    println!("\nTesting direct device connections...");
    for source in sources.iter().filter(|s| !s.is_monitor) {
        match PulseMicrophone::open("livetutor-test", Some(source.name.clone()), INPUT_SAMPLE_RATE) {
            Ok(mut mic) => {
                print!("{}: ", source.name);
                probe_microphone(&mut mic).await;
                mic.stop();
            }
            Err(e) => println!("{}: failed ({})", source.name, e),
        }
    }

    println!("\nTesting playback with a short tone...");
    match backend.open_output(OUTPUT_SAMPLE_RATE) {
        Ok(mut stream) => {
            stream.device.resume()?;
            let tone: Vec<f32> = (0..OUTPUT_SAMPLE_RATE / 2)
                .map(|i| {
                    let t = i as f32 / OUTPUT_SAMPLE_RATE as f32;
                    0.2 * (2.0 * std::f32::consts::PI * 440.0 * t).sin()
                })
                .collect();
            let buffer = PlayableBuffer::new(tone, OUTPUT_SAMPLE_RATE, 1);
            let at = stream.device.current_time();
            let id = stream.device.start(buffer, at)?;
            match tokio::time::timeout(Duration::from_secs(2), stream.ended.recv()).await {
                Ok(Some(ended)) if ended == id => println!(
                    "Tone played, device clock at {:.2}s",
                    stream.device.current_time()
                ),
                _ => println!("Tone did not finish in time"),
            }
            stream.device.close();
        }
        Err(e) => println!("Failed to open output: {}", e),
    }

    Ok(())
}

/// Read one frame and report its loudness.
async fn probe_microphone(mic: &mut dyn InputDevice) {
    let mut frames = match mic.start(PROBE_FRAME) {
        Ok(frames) => frames,
        Err(e) => {
            println!("failed to start ({})", e);
            return;
        }
    };
    match tokio::time::timeout(Duration::from_secs(1), frames.recv()).await {
        Ok(Some(frame)) => println!("{} samples, RMS {:.4}", frame.len(), frame.rms()),
        _ => println!("no audio within 1s"),
    }
}
