use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use crate::core::config::PlannerConfig;
use crate::error::{ConvError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BackendType {
    Rocm,
    Cuda,
    Cpu,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceProfile {
    pub backend: BackendType,
    pub name: String, // "gfx900", "gfx803", ...

    pub max_compute_units: usize,
    pub simd_width: usize,        // AMD: 64, NVIDIA: 32
    pub local_memory_size: usize, // LDS / shared memory per work group
    pub max_mem_alloc_size: usize,
}

impl DeviceProfile {
    /// Profile of an AMD GPU identified by its architecture name.
    pub fn rocm(name: &str, max_compute_units: usize) -> Self {
        Self {
            backend: BackendType::Rocm,
            name: name.to_string(),
            max_compute_units,
            simd_width: 64,
            local_memory_size: 64 * 1024,
            max_mem_alloc_size: 4 << 30,
        }
    }

    pub fn with_max_mem_alloc_size(mut self, bytes: usize) -> Self {
        self.max_mem_alloc_size = bytes;
        self
    }

    pub fn is_gfx8(&self) -> bool {
        self.name.starts_with("gfx8")
    }
}

impl Default for DeviceProfile {
    fn default() -> Self {
        Self::rocm("gfx900", 64)
    }
}

/// Opaque device buffer reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BufferId(u64);

/// A compiled program, ready to launch kernels from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Program {
    pub device: String,
    pub name: String,
    pub options: String,
    pub build_id: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LaunchParams {
    pub global: [usize; 3],
    pub local: [usize; 3],
}

impl LaunchParams {
    pub fn new(global: [usize; 3], local: [usize; 3]) -> Self {
        Self { global, local }
    }
}

/// Boundary to the device/queue layer.
///
/// One handle owns one in-order queue. Every call except [`finish`] only
/// enqueues work; `finish` blocks until the queue drains and is the only
/// place a hung device can surface, as [`ConvError::DeviceTimeout`].
///
/// [`finish`]: DeviceHandle::finish
pub trait DeviceHandle {
    fn profile(&self) -> &DeviceProfile;

    fn device_name(&self) -> &str {
        &self.profile().name
    }

    fn max_compute_units(&self) -> usize {
        self.profile().max_compute_units
    }

    fn local_memory_size(&self) -> usize {
        self.profile().local_memory_size
    }

    fn max_mem_alloc_size(&self) -> usize {
        self.profile().max_mem_alloc_size
    }

    fn allocate(&self, bytes: usize) -> Result<BufferId>;
    fn free(&self, buffer: BufferId) -> Result<()>;
    fn write_buffer(&self, buffer: BufferId, data: &[u8]) -> Result<()>;
    fn read_buffer(&self, buffer: BufferId, out: &mut [u8]) -> Result<()>;
    fn copy_buffer(&self, src: BufferId, dst: BufferId, bytes: usize) -> Result<()>;

    fn load_program(&self, program: &str, options: &str) -> Result<Arc<Program>>;

    fn launch(&self, program: &Program, kernel: &str, params: LaunchParams, args: &[BufferId]) -> Result<()>;

    /// Duration of the most recently completed kernel.
    fn kernel_time_ms(&self) -> f32;

    fn finish(&self) -> Result<()>;
}

type ProgramKey = (String, String, String);

/// Compiled programs keyed by (device, program, build options).
#[derive(Debug, Default)]
pub struct ProgramCache {
    programs: HashMap<ProgramKey, Arc<Program>>,
    builds: u64,
}

impl ProgramCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_or_build<F>(&mut self, device: &str, program: &str, options: &str, build: F) -> Result<Arc<Program>>
    where
        F: FnOnce(u64) -> Result<Program>,
    {
        let key = (device.to_string(), program.to_string(), options.to_string());
        if let Some(found) = self.programs.get(&key) {
            return Ok(Arc::clone(found));
        }
        let built = Arc::new(build(self.builds)?);
        self.builds += 1;
        log::debug!("compiled {} for {} with \"{}\"", program, device, options);
        self.programs.insert(key, Arc::clone(&built));
        Ok(built)
    }

    /// Number of compilations performed so far.
    pub fn builds(&self) -> u64 {
        self.builds
    }

    pub fn len(&self) -> usize {
        self.programs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.programs.is_empty()
    }
}

/// Backing bytes grow on first write so large scratch buffers cost nothing
/// until touched.
#[derive(Debug, Default)]
struct SimBuffer {
    len: usize,
    data: Vec<u8>,
}

impl SimBuffer {
    fn read(&self, out: &mut [u8]) {
        let n = out.len().min(self.data.len());
        out[..n].copy_from_slice(&self.data[..n]);
        out[n..].fill(0);
    }

    fn write(&mut self, data: &[u8]) {
        if self.data.len() < data.len() {
            self.data.resize(data.len(), 0);
        }
        self.data[..data.len()].copy_from_slice(data);
    }
}

#[derive(Debug, Default)]
struct SimState {
    next_buffer: u64,
    buffers: HashMap<BufferId, SimBuffer>,
    programs: ProgramCache,
    pending_ms: f64,
    last_kernel_ms: f32,
    launches: u64,
}

/// Deterministic in-process device.
///
/// Kernel durations come from a simple occupancy model over the launch
/// geometry, so tuning searches on it are repeatable across runs.
#[derive(Debug)]
pub struct SimulatedDevice {
    profile: DeviceProfile,
    sync_timeout: Duration,
    failing_kernels: Vec<String>,
    state: Mutex<SimState>,
}

impl SimulatedDevice {
    pub fn new(profile: DeviceProfile) -> Self {
        Self {
            profile,
            sync_timeout: Duration::from_millis(PlannerConfig::DEFAULT_SYNC_TIMEOUT_MS),
            failing_kernels: Vec::new(),
            state: Mutex::new(SimState::default()),
        }
    }

    pub fn from_config(profile: DeviceProfile, config: &PlannerConfig) -> Self {
        Self::new(profile).with_sync_timeout(config.sync_timeout)
    }

    pub fn with_sync_timeout(mut self, timeout: Duration) -> Self {
        self.sync_timeout = timeout;
        self
    }

    /// Makes every launch of `kernel` fail with a device error.
    pub fn with_failing_kernel(mut self, kernel: &str) -> Self {
        self.failing_kernels.push(kernel.to_string());
        self
    }

    /// Queues `duration` of extra work, as a stuck kernel would.
    pub fn stall(&self, duration: Duration) -> Result<()> {
        self.lock()?.pending_ms += duration.as_secs_f64() * 1e3;
        Ok(())
    }

    pub fn launches(&self) -> u64 {
        self.lock().map(|s| s.launches).unwrap_or(0)
    }

    pub fn program_builds(&self) -> u64 {
        self.lock().map(|s| s.programs.builds()).unwrap_or(0)
    }

    pub fn live_buffers(&self) -> usize {
        self.lock().map(|s| s.buffers.len()).unwrap_or(0)
    }

    fn lock(&self) -> Result<MutexGuard<'_, SimState>> {
        self.state
            .lock()
            .map_err(|_| ConvError::Device("simulated device state poisoned".into()))
    }

    fn estimate_ms(&self, params: LaunchParams) -> Result<f64> {
        let group: usize = params.local.iter().product();
        if group == 0 || params.local.iter().zip(params.global.iter()).any(|(l, g)| *l == 0 || *g == 0) {
            return Err(ConvError::Device(format!("invalid launch geometry {:?}", params)));
        }
        if group > 1024 {
            return Err(ConvError::Device(format!("work group of {} exceeds 1024", group)));
        }
        let groups: usize = params
            .global
            .iter()
            .zip(params.local.iter())
            .map(|(g, l)| g.div_ceil(*l))
            .product();
        let simd = self.profile.simd_width.max(1);
        let waves_per_group = group.div_ceil(simd);
        let cu = self.profile.max_compute_units.max(1);
        let rounds = groups.div_ceil(cu);
        // Partially filled wavefronts still occupy a full SIMD slot.
        Ok(0.005 + rounds as f64 * waves_per_group as f64 * 1e-3)
    }
}

impl DeviceHandle for SimulatedDevice {
    fn profile(&self) -> &DeviceProfile {
        &self.profile
    }

    fn allocate(&self, bytes: usize) -> Result<BufferId> {
        if bytes > self.profile.max_mem_alloc_size {
            return Err(ConvError::Device(format!(
                "allocation of {} bytes exceeds the {} byte limit",
                bytes, self.profile.max_mem_alloc_size
            )));
        }
        let mut state = self.lock()?;
        let id = BufferId(state.next_buffer);
        state.next_buffer += 1;
        state.buffers.insert(id, SimBuffer { len: bytes, data: Vec::new() });
        Ok(id)
    }

    fn free(&self, buffer: BufferId) -> Result<()> {
        self.lock()?
            .buffers
            .remove(&buffer)
            .map(|_| ())
            .ok_or_else(|| ConvError::Device(format!("double free of {:?}", buffer)))
    }

    fn write_buffer(&self, buffer: BufferId, data: &[u8]) -> Result<()> {
        let mut state = self.lock()?;
        let dst = state
            .buffers
            .get_mut(&buffer)
            .ok_or_else(|| ConvError::Device(format!("unknown buffer {:?}", buffer)))?;
        if data.len() > dst.len {
            return Err(ConvError::Device(format!(
                "write of {} bytes into a {} byte buffer",
                data.len(),
                dst.len
            )));
        }
        dst.write(data);
        Ok(())
    }

    fn read_buffer(&self, buffer: BufferId, out: &mut [u8]) -> Result<()> {
        let state = self.lock()?;
        let src = state
            .buffers
            .get(&buffer)
            .ok_or_else(|| ConvError::Device(format!("unknown buffer {:?}", buffer)))?;
        if out.len() > src.len {
            return Err(ConvError::Device(format!(
                "read of {} bytes from a {} byte buffer",
                out.len(),
                src.len
            )));
        }
        src.read(out);
        Ok(())
    }

    fn copy_buffer(&self, src: BufferId, dst: BufferId, bytes: usize) -> Result<()> {
        let mut state = self.lock()?;
        let mut data = vec![0u8; bytes];
        match state.buffers.get(&src) {
            Some(b) if b.len >= bytes => b.read(&mut data),
            Some(b) => {
                return Err(ConvError::Device(format!(
                    "copy of {} bytes from a {} byte buffer",
                    bytes, b.len
                )))
            }
            None => return Err(ConvError::Device(format!("unknown buffer {:?}", src))),
        }
        match state.buffers.get_mut(&dst) {
            Some(b) if b.len >= bytes => {
                b.write(&data);
                Ok(())
            }
            _ => Err(ConvError::Device(format!("copy into {:?} out of range", dst))),
        }
    }

    fn load_program(&self, program: &str, options: &str) -> Result<Arc<Program>> {
        let device = self.profile.name.clone();
        let options = format!("{} -mcpu={}", options, device).trim().to_string();
        let mut state = self.lock()?;
        state.programs.get_or_build(&device, program, &options, |build_id| {
            Ok(Program {
                device: device.clone(),
                name: program.to_string(),
                options: options.clone(),
                build_id,
            })
        })
    }

    fn launch(&self, program: &Program, kernel: &str, params: LaunchParams, args: &[BufferId]) -> Result<()> {
        if self.failing_kernels.iter().any(|k| k == kernel) {
            return Err(ConvError::Device(format!("launch of {} from {} failed", kernel, program.name)));
        }
        let ms = self.estimate_ms(params)?;
        let mut state = self.lock()?;
        if let Some(missing) = args.iter().find(|b| !state.buffers.contains_key(b)) {
            return Err(ConvError::Device(format!("kernel {} bound to unknown buffer {:?}", kernel, missing)));
        }
        state.pending_ms += ms;
        state.last_kernel_ms = ms as f32;
        state.launches += 1;
        Ok(())
    }

    fn kernel_time_ms(&self) -> f32 {
        self.lock().map(|s| s.last_kernel_ms).unwrap_or(0.0)
    }

    fn finish(&self) -> Result<()> {
        let mut state = self.lock()?;
        let waited = std::mem::take(&mut state.pending_ms);
        let limit_ms = self.sync_timeout.as_millis() as u64;
        if waited > limit_ms as f64 {
            log::error!("device {} did not drain within {} ms", self.profile.name, limit_ms);
            return Err(ConvError::DeviceTimeout {
                waited_ms: waited as u64,
                limit_ms,
            });
        }
        Ok(())
    }
}
