use interview_voice::audio::{list_devices, DeviceType, PulseDevices, PulseMicrophone};
use interview_voice::capture::{MediaDevices, MicrophoneStream};
use std::error::Error;
use std::time::Duration;

fn main() -> Result<(), Box<dyn Error>> {
    // Initialize logging
    tracing_subscriber::fmt::init();

    println!("Available audio input devices:");
    let devices = match list_devices("interview-voice-test", DeviceType::Any) {
        Ok(devices) => devices,
        Err(e) => {
            println!("Error listing devices: {}", e);
            Vec::new()
        }
    };
    if devices.is_empty() {
        println!("No audio devices found!");
    }
    for (i, device) in devices.iter().enumerate() {
        println!(
            "{}: {} ({})",
            i + 1,
            device.description,
            if device.is_monitor { "Monitor" } else { "Microphone" }
        );
        println!("   Name: {}", device.name);
        println!("   Rate: {} Hz, Channels: {}", device.sample_rate, device.channels);
        println!();
    }

    // The source a call would pick
    println!("\nTesting microphone selection...");
    match PulseDevices::new("interview-voice-test", None, false).open_microphone() {
        Ok(mut mic) => {
            let mut block = vec![0.0f32; 4096];
            match mic.read_block(&mut block) {
                Ok(()) => {
                    let peak = block.iter().fold(0.0f32, |m, s| m.max(s.abs()));
                    println!("Read one block at {} Hz, peak level {:.3}", mic.sample_rate(), peak);
                }
                Err(e) => println!("Opened but could not read: {}", e),
            }
            mic.stop();
        }
        Err(e) => println!("Failed to open a microphone: {}", e),
    }

    println!("\nTesting direct device connections...");
    for device in devices.iter().filter(|d| !d.is_monitor) {
        println!("Trying to connect to: {}", device.description);
        match PulseMicrophone::open("interview-voice-test", Some(&device.name), device.sample_rate) {
            Ok(mut mic) => {
                println!("  ✅ Success ({:?})", mic.device_name());
                std::thread::sleep(Duration::from_millis(500));
                mic.stop();
            }
            Err(e) => println!("  ❌ Failed: {}", e),
        }
    }

    println!("\nAudio device test complete!");
    Ok(())
}
