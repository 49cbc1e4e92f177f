//! Observability utilities: host system and (optional) GPU gauges exported
//! alongside `rt-coordinator`'s/`rt-worker`'s own request-level Prometheus
//! metrics, covering plain CPU/memory stats as well as GPU stats for
//! clusters with no GPU present.

use once_cell::sync::Lazy;
use prometheus::{Gauge, IntGauge};
use sysinfo::{CpuExt, System, SystemExt};

static GPU_UTIL: Lazy<Gauge> =
    Lazy::new(|| prometheus::register_gauge!("rt_gpu_utilization", "GPU utilization percent").unwrap());
static GPU_MEM_USED: Lazy<IntGauge> =
    Lazy::new(|| prometheus::register_int_gauge!("rt_gpu_memory_bytes", "GPU memory used (bytes)").unwrap());
static GPU_TEMP: Lazy<Gauge> =
    Lazy::new(|| prometheus::register_gauge!("rt_gpu_temperature_celsius", "GPU temperature in C").unwrap());

static CPU_PERCENT: Lazy<Gauge> =
    Lazy::new(|| prometheus::register_gauge!("rt_host_cpu_percent", "Host CPU utilization percent").unwrap());
static MEM_USED_BYTES: Lazy<IntGauge> =
    Lazy::new(|| prometheus::register_int_gauge!("rt_host_memory_used_bytes", "Host memory in use").unwrap());

/// Registers every gauge so `/metrics` reports them even before the first
/// poll tick, and avoids dead-code warnings when the `nvidia` feature is off.
pub fn init() {
    let _ = &*GPU_UTIL;
    let _ = &*GPU_MEM_USED;
    let _ = &*GPU_TEMP;
    let _ = &*CPU_PERCENT;
    let _ = &*MEM_USED_BYTES;
}

/// Polls host CPU and memory once a second for as long as the process
/// runs. Call once per process (coordinator or worker), after [`init`].
pub fn spawn_system_polling() {
    tokio::spawn(async move {
        let mut sys = System::new();
        loop {
            sys.refresh_cpu();
            sys.refresh_memory();
            let cpu_avg: f32 =
                sys.cpus().iter().map(|c| c.cpu_usage()).sum::<f32>() / sys.cpus().len().max(1) as f32;
            CPU_PERCENT.set(cpu_avg as f64);
            MEM_USED_BYTES.set(sys.used_memory() as i64 * 1024);
            tokio::time::sleep(std::time::Duration::from_secs(1)).await;
        }
    });
}

/// Polls the first NVML-visible GPU once a second when built with the
/// `nvidia` feature; a no-op otherwise.
pub fn spawn_gpu_polling() {
    #[cfg(feature = "nvidia")]
    tokio::spawn(async move {
        let nvml = match nvml_wrapper::NVML::init() {
            Ok(n) => n,
            Err(_) => return,
        };
        let device = match nvml.device_by_index(0) {
            Ok(d) => d,
            Err(_) => return,
        };
        loop {
            if let Ok(util) = device.utilization_rates() {
                GPU_UTIL.set(util.gpu as f64);
            }
            if let Ok(mem) = device.memory_info() {
                GPU_MEM_USED.set(mem.used as i64);
            }
            if let Ok(temp) = device.temperature(nvml_wrapper::enum_wrappers::device::TemperatureSensor::Gpu) {
                GPU_TEMP.set(temp as f64);
            }
            tokio::time::sleep(std::time::Duration::from_secs(1)).await;
        }
    });
}
