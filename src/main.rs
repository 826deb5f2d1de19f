use std::process::exit;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};

use dp100::sim::SimulatedDp100;
use dp100::{logging, DeviceConfig, Dp100, Sampler, SamplerConfig, SamplerEvent, SharedDevice};

#[derive(Parser, Debug)]
#[command(name = "dp100", about = "Control and sample an Alientek DP100 power supply")]
struct Args {
    /// Use an in-process simulated supply instead of USB hardware
    #[arg(long, global = true)]
    simulate: bool,
    /// Log level (overrides DP100_LOG / RUST_LOG)
    #[arg(long, global = true)]
    log_level: Option<String>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print live readings and active setpoints
    Status {
        #[arg(long)]
        json: bool,
    },
    /// Change setpoints; unspecified values are kept
    Set {
        /// Output voltage in volts (0-30)
        #[arg(long)]
        voltage: Option<f64>,
        /// Current limit in amps (0-5)
        #[arg(long)]
        current: Option<f64>,
        #[arg(long, value_enum)]
        output: Option<OutputArg>,
    },
    /// Sample the output at a fixed rate
    Sample {
        #[arg(long, default_value_t = 5)]
        seconds: u64,
        /// Samples per second (1-100)
        #[arg(long, default_value_t = 50)]
        rate: u32,
        /// One JSON object per measurement
        #[arg(long)]
        json: bool,
    },
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum OutputArg {
    On,
    Off,
}

fn main() {
    if let Err(e) = run() {
        eprintln!("Error: {e:#}");
        exit(1);
    }
}

fn run() -> Result<()> {
    let args = Args::parse();
    logging::init_logging_with(args.log_level.as_deref());

    let device = open_device(args.simulate);
    if !device.lock().connect() {
        bail!("could not connect to DP100 (is it plugged in and in USB mode?)");
    }

    match args.command {
        Command::Status { json } => status(&device, json),
        Command::Set {
            voltage,
            current,
            output,
        } => set(&device, voltage, current, output),
        Command::Sample {
            seconds,
            rate,
            json,
        } => sample(device, Duration::from_secs(seconds), rate, json),
    }
}

fn open_device(simulate: bool) -> SharedDevice {
    if simulate {
        let sim = SimulatedDp100::new();
        Dp100::with_opener(sim.opener(), sim.device_config()).into_shared()
    } else {
        Dp100::open_hid(DeviceConfig::default()).into_shared()
    }
}

fn status(device: &SharedDevice, json: bool) -> Result<()> {
    let mut psu = device.lock();
    let status = psu
        .get_full_status()
        .context("device did not answer the status request")?;
    let info = psu.device_info();

    if json {
        let value = serde_json::json!({ "device": info, "status": status });
        println!("{}", serde_json::to_string_pretty(&value)?);
        return Ok(());
    }

    println!(
        "DP100 {:04X}:{:04X}",
        info.vendor_id, info.product_id
    );
    println!(
        "  set:    {:6.3} V  {:6.3} A  output {}",
        status.voltage_set,
        status.current_set,
        if status.output_enabled { "on" } else { "off" }
    );
    println!(
        "  output: {:6.3} V  {:6.3} A  {:7.3} W",
        status.voltage_out, status.current_out, status.power_out
    );
    println!("  temp:   {:.1} C", status.temperature);
    Ok(())
}

fn set(
    device: &SharedDevice,
    voltage: Option<f64>,
    current: Option<f64>,
    output: Option<OutputArg>,
) -> Result<()> {
    if voltage.is_none() && current.is_none() && output.is_none() {
        bail!("nothing to set; pass --voltage, --current or --output");
    }
    let mut psu = device.lock();

    if let Some(v) = voltage {
        if !psu.set_voltage(v)? {
            bail!("supply did not confirm voltage {v} V");
        }
    }
    if let Some(i) = current {
        if !psu.set_current(i)? {
            bail!("supply did not confirm current {i} A");
        }
    }
    if let Some(o) = output {
        let enabled = matches!(o, OutputArg::On);
        if !psu.set_output(enabled)? {
            bail!("supply did not confirm output change");
        }
    }

    let shadow = psu.shadow();
    println!(
        "Setpoints: {:.3} V, {:.3} A, output {}",
        shadow.voltage_set_mv as f64 / 1000.0,
        shadow.current_set_ma as f64 / 1000.0,
        if shadow.output_enabled { "on" } else { "off" }
    );
    Ok(())
}

fn sample(device: SharedDevice, duration: Duration, rate: u32, json: bool) -> Result<()> {
    let mut sampler = Sampler::new(device, SamplerConfig::with_rate(rate))?;
    let mut events = sampler.take_events();
    sampler.start().context("failed to start sampling")?;

    let deadline = Instant::now() + duration;
    while Instant::now() < deadline {
        thread::sleep(Duration::from_millis(100));

        for m in sampler.get_samples(usize::MAX) {
            if json {
                println!("{}", serde_json::to_string(&m)?);
            } else {
                println!(
                    "{:.3}  {:6.3} V  {:6.3} A  {:7.3} W",
                    m.timestamp_secs(),
                    m.voltage,
                    m.current,
                    m.power
                );
            }
        }

        if let Some(rx) = events.as_mut() {
            while let Ok(event) = rx.try_recv() {
                match event {
                    SamplerEvent::Status(report) => log::info!(
                        "{:.1}/{:.0} Hz, {} samples, {} errors, {} missed, queue {}",
                        report.samples_per_second,
                        report.target_rate,
                        report.samples_collected,
                        report.errors,
                        report.missed_samples,
                        report.queue_size
                    ),
                    SamplerEvent::Error(msg) => log::warn!("{msg}"),
                    SamplerEvent::Reconnected => log::info!("supply reconnected"),
                    SamplerEvent::ReconnectFailed { attempts } => {
                        log::error!("supply lost, {attempts} reconnect attempts failed")
                    }
                }
            }
        }
    }

    sampler.stop();
    let stats = sampler.statistics();
    if json {
        eprintln!("{}", serde_json::to_string(&stats)?);
    } else {
        eprintln!(
            "Collected {} samples ({} errors, {} missed, {} dropped)",
            stats.samples_collected, stats.errors, stats.missed_samples, stats.dropped_samples
        );
    }
    Ok(())
}
