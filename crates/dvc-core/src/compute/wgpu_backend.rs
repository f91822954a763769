//! wgpu-based GPU correlation and sub-voxel backends (Metal / Vulkan / DX12).
//!
//! Each worker owns its own [`WgpuDevice`]. Correlation is evaluated directly
//! in the spatial domain, one invocation per (item, output position); the
//! refiner assembles the normal equations on the device and solves on the
//! host. Device arithmetic is `f32`; normalization happens on the host in
//! `f64`.

use std::sync::Arc;

use bytemuck::{Pod, Zeroable};
use ndarray::{Array3, ArrayView3, Axis};
use tracing::{debug, info};
use wgpu::util::DeviceExt;

use crate::consts::GPU_WORKGROUP_SIZE;
use crate::error::{DvcError, Result};
use crate::subvoxel::{check_patches, filter_offset, solve_filter};
use crate::volume::PatchBatch;

use super::ncc::{finalize_window, normalize_kernel};
use super::{CorrelationBackend, CorrelationBatch, Sealed, SubvoxelRefiner};

// ---------------------------------------------------------------------------
// Inline WGSL shaders
// ---------------------------------------------------------------------------

const CORRELATE_WGSL: &str = r"
struct Params {
    kx: u32, ky: u32, kz: u32, count: u32,
    rx: u32, ry: u32, rz: u32, _pad0: u32,
    cx: u32, cy: u32, cz: u32, _pad1: u32,
}
@group(0) @binding(0) var<storage, read>       kernels: array<f32>;
@group(0) @binding(1) var<storage, read>       rois:    array<f32>;
@group(0) @binding(2) var<storage, read_write> output:  array<f32>;
@group(0) @binding(3) var<uniform>             params:  Params;
@compute @workgroup_size(64)
fn main(@builtin(global_invocation_id) gid: vec3<u32>,
        @builtin(num_workgroups) groups: vec3<u32>) {
    let idx = gid.y * groups.x * 64u + gid.x;
    if idx >= params.count { return; }
    let per_item = params.cx * params.cy * params.cz;
    let item = idx / per_item;
    let pos = idx % per_item;
    let px = pos / (params.cy * params.cz);
    let py = (pos / params.cz) % params.cy;
    let pz = pos % params.cz;
    let kb = item * params.kx * params.ky * params.kz;
    let rb = item * params.rx * params.ry * params.rz;
    let n = f32(params.kx * params.ky * params.kz);

    var corr = 0.0;
    var sum = 0.0;
    for (var a = 0u; a < params.kx; a++) {
        for (var b = 0u; b < params.ky; b++) {
            for (var c = 0u; c < params.kz; c++) {
                let r = rois[rb + ((px + a) * params.ry + py + b) * params.rz + pz + c];
                corr += kernels[kb + (a * params.ky + b) * params.kz + c] * r;
                sum += r;
            }
        }
    }
    let mean = sum / n;
    var dev = 0.0;
    for (var a = 0u; a < params.kx; a++) {
        for (var b = 0u; b < params.ky; b++) {
            for (var c = 0u; c < params.kz; c++) {
                let d = rois[rb + ((px + a) * params.ry + py + b) * params.rz + pz + c] - mean;
                dev += d * d;
            }
        }
    }
    output[idx * 3u] = corr;
    output[idx * 3u + 1u] = mean;
    output[idx * 3u + 2u] = dev / n;
}
";

const NORMAL_EQUATIONS_WGSL: &str = r"
struct Params {
    sx: u32, sy: u32, sz: u32, f: u32,
    vx: u32, vy: u32, vz: u32, taps: u32,
    count: u32, _pad0: u32, _pad1: u32, _pad2: u32,
}
@group(0) @binding(0) var<storage, read>       ref_patch: array<f32>;
@group(0) @binding(1) var<storage, read>       tgt_patch: array<f32>;
@group(0) @binding(2) var<storage, read_write> output:    array<f32>;
@group(0) @binding(3) var<uniform>             params:    Params;

fn tap_offset(t: u32) -> u32 {
    let a = t / (params.f * params.f);
    let b = (t / params.f) % params.f;
    let c = t % params.f;
    return (a * params.sy + b) * params.sz + c;
}

@compute @workgroup_size(64)
fn main(@builtin(global_invocation_id) gid: vec3<u32>,
        @builtin(num_workgroups) groups: vec3<u32>) {
    let idx = gid.y * groups.x * 64u + gid.x;
    if idx >= params.count { return; }
    let square = params.taps * params.taps;
    let centre = params.f / 2u - 1u;
    let centre_offset = (centre * params.sy + centre) * params.sz + centre;

    var u = 0u;
    var v_offset = 0u;
    var against_target = false;
    if idx < square {
        u = idx / params.taps;
        v_offset = tap_offset(idx % params.taps);
    } else {
        u = idx - square;
        v_offset = centre_offset;
        against_target = true;
    }
    let u_offset = tap_offset(u);

    var acc = 0.0;
    for (var px = 0u; px < params.vx; px++) {
        for (var py = 0u; py < params.vy; py++) {
            for (var pz = 0u; pz < params.vz; pz++) {
                let base = (px * params.sy + py) * params.sz + pz;
                let x = ref_patch[base + u_offset];
                if against_target {
                    acc += x * tgt_patch[base + v_offset];
                } else {
                    acc += x * ref_patch[base + v_offset];
                }
            }
        }
    }
    output[idx] = acc;
}
";

// ---------------------------------------------------------------------------
// Uniform parameter structs (must match WGSL layouts exactly)
// ---------------------------------------------------------------------------

#[repr(C)]
#[derive(Clone, Copy, Pod, Zeroable)]
struct CorrelateParams {
    kx: u32,
    ky: u32,
    kz: u32,
    count: u32,
    rx: u32,
    ry: u32,
    rz: u32,
    _pad0: u32,
    cx: u32,
    cy: u32,
    cz: u32,
    _pad1: u32,
}

#[repr(C)]
#[derive(Clone, Copy, Pod, Zeroable)]
struct NormalEquationParams {
    sx: u32,
    sy: u32,
    sz: u32,
    f: u32,
    vx: u32,
    vy: u32,
    vz: u32,
    taps: u32,
    count: u32,
    _pad0: u32,
    _pad1: u32,
    _pad2: u32,
}

const fn div_ceil(a: u32, b: u32) -> u32 {
    (a + b - 1) / b
}

/// Workgroup grid covering `threads` invocations, folded into y when x
/// would exceed the per-dimension dispatch limit.
fn workgroups_for(threads: u32) -> (u32, u32, u32) {
    const MAX_PER_DIM: u32 = 65_535;
    let groups = div_ceil(threads.max(1), GPU_WORKGROUP_SIZE);
    if groups <= MAX_PER_DIM {
        (groups, 1, 1)
    } else {
        (MAX_PER_DIM, div_ceil(groups, MAX_PER_DIM), 1)
    }
}

fn to_u32(value: usize, what: &str) -> Result<u32> {
    u32::try_from(value).map_err(|_| DvcError::GpuError(format!("{what} {value} exceeds u32")))
}

// ---------------------------------------------------------------------------
// Device
// ---------------------------------------------------------------------------

/// Number of usable GPU adapters. Only the default high-performance adapter
/// is requested, so this is 0 or 1.
pub fn probe_device_count() -> usize {
    let instance = wgpu::Instance::new(&wgpu::InstanceDescriptor::default());
    match pollster::block_on(instance.request_adapter(&wgpu::RequestAdapterOptions {
        power_preference: wgpu::PowerPreference::HighPerformance,
        compatible_surface: None,
        force_fallback_adapter: false,
    })) {
        Ok(adapter) => {
            debug!(adapter = %adapter.get_info().name, "GPU adapter available");
            1
        }
        Err(e) => {
            debug!("No GPU adapter: {e}");
            0
        }
    }
}

/// A wgpu device, its queue and the compiled DVC pipelines.
pub struct WgpuDevice {
    device: wgpu::Device,
    queue: wgpu::Queue,
    adapter_name: String,
    correlate_pipeline: wgpu::ComputePipeline,
    normal_equations_pipeline: wgpu::ComputePipeline,
}

impl WgpuDevice {
    /// Open the device for backend unit `unit`.
    pub fn open(unit: usize) -> Result<Arc<Self>> {
        let instance = wgpu::Instance::new(&wgpu::InstanceDescriptor::default());

        let adapter = pollster::block_on(instance.request_adapter(&wgpu::RequestAdapterOptions {
            power_preference: wgpu::PowerPreference::HighPerformance,
            compatible_surface: None,
            force_fallback_adapter: false,
        }))
        .map_err(|e| DvcError::BackendUnavailable(format!("No suitable GPU adapter found: {e}")))?;

        let adapter_name = adapter.get_info().name.clone();
        info!(unit, "GPU adapter: {adapter_name}");

        let (device, queue) = pollster::block_on(adapter.request_device(
            &wgpu::DeviceDescriptor {
                label: Some("dvc"),
                required_features: wgpu::Features::empty(),
                required_limits: wgpu::Limits::default(),
                ..Default::default()
            },
        ))
        .map_err(|e| DvcError::GpuError(format!("Failed to create GPU device: {e}")))?;

        let mk = |label, src: &str| {
            device.create_shader_module(wgpu::ShaderModuleDescriptor {
                label: Some(label),
                source: wgpu::ShaderSource::Wgsl(src.into()),
            })
        };
        let correlate_mod = mk("correlate", CORRELATE_WGSL);
        let normal_mod = mk("normal_equations", NORMAL_EQUATIONS_WGSL);

        let pipe = |module: &wgpu::ShaderModule, entry: &str| {
            device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
                label: None,
                layout: None,
                module,
                entry_point: Some(entry),
                compilation_options: Default::default(),
                cache: None,
            })
        };
        let correlate_pipeline = pipe(&correlate_mod, "main");
        let normal_equations_pipeline = pipe(&normal_mod, "main");

        Ok(Arc::new(Self {
            device,
            queue,
            adapter_name,
            correlate_pipeline,
            normal_equations_pipeline,
        }))
    }

    pub fn adapter_name(&self) -> &str {
        &self.adapter_name
    }

    // --- Buffer helpers ---

    fn create_storage(&self, data: &[f32]) -> wgpu::Buffer {
        self.device
            .create_buffer_init(&wgpu::util::BufferInitDescriptor {
                label: None,
                contents: bytemuck::cast_slice(data),
                usage: wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_DST,
            })
    }

    fn create_output(&self, len: usize) -> wgpu::Buffer {
        self.device.create_buffer(&wgpu::BufferDescriptor {
            label: None,
            size: (len * std::mem::size_of::<f32>()) as u64,
            usage: wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_SRC,
            mapped_at_creation: false,
        })
    }

    fn create_uniform<T: Pod>(&self, data: &T) -> wgpu::Buffer {
        self.device
            .create_buffer_init(&wgpu::util::BufferInitDescriptor {
                label: None,
                contents: bytemuck::bytes_of(data),
                usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
            })
    }

    /// Run `pipeline` over `threads` invocations with bindings
    /// `(input_a, input_b, output, params)` and read the output back.
    fn run<T: Pod>(
        &self,
        pipeline: &wgpu::ComputePipeline,
        input_a: &[f32],
        input_b: &[f32],
        output_len: usize,
        params: &T,
        threads: u32,
    ) -> Result<Vec<f32>> {
        let a = self.create_storage(input_a);
        let b = self.create_storage(input_b);
        let out = self.create_output(output_len);
        let uniform = self.create_uniform(params);

        let layout = pipeline.get_bind_group_layout(0);
        let bg = self.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: None,
            layout: &layout,
            entries: &[
                wgpu::BindGroupEntry {
                    binding: 0,
                    resource: a.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 1,
                    resource: b.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 2,
                    resource: out.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 3,
                    resource: uniform.as_entire_binding(),
                },
            ],
        });

        let size = out.size();
        let staging = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: None,
            size,
            usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });

        let (gx, gy, gz) = workgroups_for(threads);
        let mut enc = self.device.create_command_encoder(&Default::default());
        {
            let mut pass = enc.begin_compute_pass(&Default::default());
            pass.set_pipeline(pipeline);
            pass.set_bind_group(0, &bg, &[]);
            pass.dispatch_workgroups(gx, gy, gz);
        }
        enc.copy_buffer_to_buffer(&out, 0, &staging, 0, size);
        self.queue.submit(std::iter::once(enc.finish()));

        let slice = staging.slice(..);
        let (tx, rx) = std::sync::mpsc::sync_channel(1);
        slice.map_async(wgpu::MapMode::Read, move |r| {
            tx.send(r).ok();
        });
        self.device
            .poll(wgpu::PollType::wait_indefinitely())
            .map_err(|e| DvcError::GpuError(format!("device poll failed: {e}")))?;
        rx.recv()
            .map_err(|_| DvcError::GpuError("GPU channel closed".into()))?
            .map_err(|e| DvcError::GpuError(format!("buffer mapping failed: {e}")))?;

        let data = slice.get_mapped_range();
        let result: Vec<f32> = bytemuck::cast_slice(&data).to_vec();
        drop(data);
        staging.unmap();
        Ok(result)
    }
}

// ---------------------------------------------------------------------------
// Correlator
// ---------------------------------------------------------------------------

/// GPU correlation backend.
pub struct WgpuCorrelator {
    device: Arc<WgpuDevice>,
    kernel_shape: [usize; 3],
    roi_shape: [usize; 3],
}

impl WgpuCorrelator {
    pub fn new(device: Arc<WgpuDevice>, kernel_shape: [usize; 3], roi_shape: [usize; 3]) -> Self {
        Self {
            device,
            kernel_shape,
            roi_shape,
        }
    }
}

impl Sealed for WgpuCorrelator {}

impl CorrelationBackend for WgpuCorrelator {
    fn name(&self) -> &str {
        "GPU/wgpu"
    }

    fn correlate(&mut self, batch: &PatchBatch) -> Result<CorrelationBatch> {
        let [kx, ky, kz] = self.kernel_shape;
        let [rx, ry, rz] = self.roi_shape;
        let valid: [usize; 3] = std::array::from_fn(|d| self.roi_shape[d] - self.kernel_shape[d] + 1);
        let [cx, cy, cz] = valid;
        let n = batch.len();
        let window_len = kx * ky * kz;

        let mut kernels = Vec::with_capacity(n * window_len);
        let mut rois = Vec::with_capacity(n * rx * ry * rz);
        let mut kernel_sums = Vec::with_capacity(n);
        for item in 0..n {
            let (normalized, _) = normalize_kernel(&batch.kernel(item));
            let start = kernels.len();
            kernels.extend(normalized.iter().map(|&v| v as f32));
            kernel_sums.push(kernels[start..].iter().map(|&v| v as f64).sum::<f64>());
            rois.extend(batch.roi(item).iter().copied());
        }

        let count = n * cx * cy * cz;
        let params = CorrelateParams {
            kx: to_u32(kx, "kernel extent")?,
            ky: to_u32(ky, "kernel extent")?,
            kz: to_u32(kz, "kernel extent")?,
            count: to_u32(count, "output size")?,
            rx: to_u32(rx, "ROI extent")?,
            ry: to_u32(ry, "ROI extent")?,
            rz: to_u32(rz, "ROI extent")?,
            _pad0: 0,
            cx: to_u32(cx, "output extent")?,
            cy: to_u32(cy, "output extent")?,
            cz: to_u32(cz, "output extent")?,
            _pad1: 0,
        };
        let raw = self.device.run(
            &self.device.correlate_pipeline,
            &kernels,
            &rois,
            count * 3,
            &params,
            params.count,
        )?;

        let mut out = CorrelationBatch::zeros(n, valid);
        let window = window_len as f64;
        for (i, ((corr, mean), std)) in out
            .correlation
            .iter_mut()
            .zip(out.mean.iter_mut())
            .zip(out.std.iter_mut())
            .enumerate()
        {
            let mu = raw[i * 3 + 1] as f64;
            let var = raw[i * 3 + 2] as f64;
            *corr = raw[i * 3] as f64;
            *mean = mu * window;
            *std = (var + mu * mu) * window;
        }

        for (item, kernel_sum) in kernel_sums.into_iter().enumerate() {
            finalize_window(
                out.mean.index_axis_mut(Axis(0), item),
                out.std.index_axis_mut(Axis(0), item),
                out.correlation.index_axis_mut(Axis(0), item),
                kernel_sum,
                window_len,
            );
        }
        Ok(out)
    }
}

// ---------------------------------------------------------------------------
// Refiner
// ---------------------------------------------------------------------------

/// GPU optimal-filter refiner: device-side `X^T X` / `X^T i`, host solve.
pub struct WgpuRefiner {
    device: Arc<WgpuDevice>,
    filter_size: usize,
}

impl WgpuRefiner {
    pub fn new(device: Arc<WgpuDevice>, filter_size: usize) -> Self {
        Self {
            device,
            filter_size,
        }
    }
}

impl Sealed for WgpuRefiner {}

impl SubvoxelRefiner for WgpuRefiner {
    fn refine(&mut self, reference: &ArrayView3<f32>, roi: &ArrayView3<f32>) -> Result<[f64; 3]> {
        let f = self.filter_size;
        check_patches(reference, roi, f)?;

        let (sx, sy, sz) = reference.dim();
        let taps = f * f * f;
        let count = taps * taps + taps;
        let reference_data: Vec<f32> = reference.iter().copied().collect();
        let target_data: Vec<f32> = roi.iter().copied().collect();

        let params = NormalEquationParams {
            sx: to_u32(sx, "patch extent")?,
            sy: to_u32(sy, "patch extent")?,
            sz: to_u32(sz, "patch extent")?,
            f: to_u32(f, "filter size")?,
            vx: to_u32(sx + 1 - f, "placement extent")?,
            vy: to_u32(sy + 1 - f, "placement extent")?,
            vz: to_u32(sz + 1 - f, "placement extent")?,
            taps: to_u32(taps, "filter taps")?,
            count: to_u32(count, "system size")?,
            _pad0: 0,
            _pad1: 0,
            _pad2: 0,
        };
        let raw = self.device.run(
            &self.device.normal_equations_pipeline,
            &reference_data,
            &target_data,
            count,
            &params,
            params.count,
        )?;

        let xtx: Vec<f64> = raw[..taps * taps].iter().map(|&v| v as f64).collect();
        let xti: Vec<f64> = raw[taps * taps..].iter().map(|&v| v as f64).collect();
        let filter: Array3<f64> = solve_filter(&xtx, &xti, f)?;
        Ok(filter_offset(&filter))
    }
}
