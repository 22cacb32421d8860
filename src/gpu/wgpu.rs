//! wgpu-backed rendering context.
//!
//! Framebuffer objects are wgpu textures: an RGBA8 color target (multisampled
//! when requested) paired with a combined depth/stencil attachment. Resolve
//! and composite run as render passes on the device's queue; readback copies
//! the color target into a mapped staging buffer.
//!
//! wgpu has no notion of a thread-current context, so currency checks are
//! trivially satisfied here. The check-then-switch discipline of the callers
//! still holds; it just never triggers a switch.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::rc::Rc;

use anyhow::{anyhow, Context, Result};

use crate::color::Color;
use crate::geometry::PhysicalSize;
use crate::gpu::{FramebufferId, GpuContext, GpuPaintDevice};
use crate::image::RgbaImage;

const COLOR_FORMAT: wgpu::TextureFormat = wgpu::TextureFormat::Rgba8Unorm;
const DEPTH_FORMAT: wgpu::TextureFormat = wgpu::TextureFormat::Depth24PlusStencil8;

/// Fullscreen-triangle blit used by `composite`. The vertex stage derives the
/// three corner positions from the vertex index, so no vertex buffer exists.
const COMPOSITE_SHADER: &str = r#"
struct VsOut {
    @builtin(position) position: vec4<f32>,
    @location(0) uv: vec2<f32>,
};

@vertex
fn vs_main(@builtin(vertex_index) index: u32) -> VsOut {
    let x = f32(i32(index) / 2) * 4.0 - 1.0;
    let y = f32(i32(index) % 2) * 4.0 - 1.0;
    var out: VsOut;
    out.position = vec4<f32>(x, y, 0.0, 1.0);
    out.uv = vec2<f32>((x + 1.0) * 0.5, 1.0 - (y + 1.0) * 0.5);
    return out;
}

@group(0) @binding(0) var source: texture_2d<f32>;
@group(0) @binding(1) var source_sampler: sampler;

@fragment
fn fs_main(in: VsOut) -> @location(0) vec4<f32> {
    return textureSample(source, source_sampler, in.uv);
}
"#;

struct Framebuffer {
    color: wgpu::Texture,
    color_view: wgpu::TextureView,
    depth_view: wgpu::TextureView,
    size: PhysicalSize,
    samples: u32,
}

/// Rendering context on a wgpu device.
pub struct WgpuGpu {
    device: wgpu::Device,
    queue: wgpu::Queue,
    samples: u32,
    framebuffers: RefCell<HashMap<FramebufferId, Framebuffer>>,
    next_id: Cell<u64>,
    bound: Cell<Option<FramebufferId>>,
    composite_pipeline: wgpu::RenderPipeline,
    composite_layout: wgpu::BindGroupLayout,
    sampler: wgpu::Sampler,
}

impl std::fmt::Debug for WgpuGpu {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WgpuGpu")
            .field("framebuffers", &self.framebuffers.borrow().len())
            .field("bound", &self.bound.get())
            .field("samples", &self.samples)
            .finish()
    }
}

impl WgpuGpu {
    /// Wraps an existing device and queue. `samples` is the multisample count
    /// framebuffers created through this context will use.
    pub fn new(device: wgpu::Device, queue: wgpu::Queue, samples: u32) -> Rc<Self> {
        let shader = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some("composite"),
            source: wgpu::ShaderSource::Wgsl(COMPOSITE_SHADER.into()),
        });

        let composite_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("composite"),
            entries: &[
                wgpu::BindGroupLayoutEntry {
                    binding: 0,
                    visibility: wgpu::ShaderStages::FRAGMENT,
                    ty: wgpu::BindingType::Texture {
                        sample_type: wgpu::TextureSampleType::Float { filterable: true },
                        view_dimension: wgpu::TextureViewDimension::D2,
                        multisampled: false,
                    },
                    count: None,
                },
                wgpu::BindGroupLayoutEntry {
                    binding: 1,
                    visibility: wgpu::ShaderStages::FRAGMENT,
                    ty: wgpu::BindingType::Sampler(wgpu::SamplerBindingType::Filtering),
                    count: None,
                },
            ],
        });

        let pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some("composite"),
            bind_group_layouts: &[&composite_layout],
            push_constant_ranges: &[],
        });

        // classic GL source-over for straight-alpha content
        let blend = wgpu::BlendState {
            color: wgpu::BlendComponent {
                src_factor: wgpu::BlendFactor::SrcAlpha,
                dst_factor: wgpu::BlendFactor::OneMinusSrcAlpha,
                operation: wgpu::BlendOperation::Add,
            },
            alpha: wgpu::BlendComponent {
                src_factor: wgpu::BlendFactor::One,
                dst_factor: wgpu::BlendFactor::OneMinusSrcAlpha,
                operation: wgpu::BlendOperation::Add,
            },
        };

        let composite_pipeline =
            device.create_render_pipeline(&wgpu::RenderPipelineDescriptor {
                label: Some("composite"),
                layout: Some(&pipeline_layout),
                vertex: wgpu::VertexState {
                    module: &shader,
                    entry_point: Some("vs_main"),
                    compilation_options: Default::default(),
                    buffers: &[],
                },
                fragment: Some(wgpu::FragmentState {
                    module: &shader,
                    entry_point: Some("fs_main"),
                    compilation_options: Default::default(),
                    targets: &[Some(wgpu::ColorTargetState {
                        format: COLOR_FORMAT,
                        blend: Some(blend),
                        write_mask: wgpu::ColorWrites::ALL,
                    })],
                }),
                primitive: wgpu::PrimitiveState::default(),
                depth_stencil: None,
                multisample: wgpu::MultisampleState::default(),
                multiview: None,
                cache: None,
            });

        let sampler = device.create_sampler(&wgpu::SamplerDescriptor {
            label: Some("composite"),
            address_mode_u: wgpu::AddressMode::ClampToEdge,
            address_mode_v: wgpu::AddressMode::ClampToEdge,
            mag_filter: wgpu::FilterMode::Linear,
            min_filter: wgpu::FilterMode::Linear,
            ..Default::default()
        });

        Rc::new(Self {
            device,
            queue,
            samples,
            framebuffers: RefCell::new(HashMap::new()),
            next_id: Cell::new(1),
            bound: Cell::new(None),
            composite_pipeline,
            composite_layout,
            sampler,
        })
    }

    /// Requests the platform's default adapter and a device on it. Fails when
    /// no usable adapter exists, e.g. on headless CI machines.
    pub fn from_default_adapter(samples: u32) -> Result<Rc<Self>> {
        let instance = wgpu::Instance::new(&wgpu::InstanceDescriptor::default());
        let adapter = pollster::block_on(instance.request_adapter(&wgpu::RequestAdapterOptions {
            power_preference: wgpu::PowerPreference::None,
            force_fallback_adapter: false,
            compatible_surface: None,
        }))
        .ok_or_else(|| anyhow!("no compatible gpu adapter"))?;
        let (device, queue) = pollster::block_on(adapter.request_device(
            &wgpu::DeviceDescriptor {
                label: Some("plotbuf"),
                ..Default::default()
            },
            None,
        ))
        .context("requesting wgpu device")?;
        Ok(Self::new(device, queue, samples))
    }

    fn clear_pass(&self, fb: &Framebuffer, color: Color) {
        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor { label: Some("clear") });
        {
            let _pass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
                label: Some("clear"),
                color_attachments: &[Some(wgpu::RenderPassColorAttachment {
                    view: &fb.color_view,
                    resolve_target: None,
                    ops: wgpu::Operations {
                        load: wgpu::LoadOp::Clear(wgpu::Color {
                            r: color.r as f64,
                            g: color.g as f64,
                            b: color.b as f64,
                            a: color.a as f64,
                        }),
                        store: wgpu::StoreOp::Store,
                    },
                })],
                depth_stencil_attachment: Some(wgpu::RenderPassDepthStencilAttachment {
                    view: &fb.depth_view,
                    depth_ops: Some(wgpu::Operations {
                        load: wgpu::LoadOp::Clear(1.0),
                        store: wgpu::StoreOp::Store,
                    }),
                    stencil_ops: Some(wgpu::Operations {
                        load: wgpu::LoadOp::Clear(0),
                        store: wgpu::StoreOp::Store,
                    }),
                }),
                timestamp_writes: None,
                occlusion_query_set: None,
            });
        }
        self.queue.submit(Some(encoder.finish()));
    }
}

impl GpuContext for WgpuGpu {
    fn is_current(&self) -> bool {
        true
    }

    fn make_current(&self) -> bool {
        true
    }

    fn samples(&self) -> u32 {
        self.samples
    }

    fn create_framebuffer(&self, size: PhysicalSize, samples: u32) -> Option<FramebufferId> {
        if size.pixel_count() == 0 {
            return None;
        }
        let samples = samples.max(1);
        // only single-sample targets are sampled and copied; multisampled
        // ones are reached through resolve
        let usage = if samples == 1 {
            wgpu::TextureUsages::RENDER_ATTACHMENT
                | wgpu::TextureUsages::TEXTURE_BINDING
                | wgpu::TextureUsages::COPY_SRC
                | wgpu::TextureUsages::COPY_DST
        } else {
            wgpu::TextureUsages::RENDER_ATTACHMENT
        };
        let extent = wgpu::Extent3d {
            width: size.width,
            height: size.height,
            depth_or_array_layers: 1,
        };
        let color = self.device.create_texture(&wgpu::TextureDescriptor {
            label: Some("framebuffer color"),
            size: extent,
            mip_level_count: 1,
            sample_count: samples,
            dimension: wgpu::TextureDimension::D2,
            format: COLOR_FORMAT,
            usage,
            view_formats: &[],
        });
        let depth = self.device.create_texture(&wgpu::TextureDescriptor {
            label: Some("framebuffer depth"),
            size: extent,
            mip_level_count: 1,
            sample_count: samples,
            dimension: wgpu::TextureDimension::D2,
            format: DEPTH_FORMAT,
            usage: wgpu::TextureUsages::RENDER_ATTACHMENT,
            view_formats: &[],
        });

        let id = FramebufferId::new(self.next_id.get());
        self.next_id.set(self.next_id.get() + 1);
        let color_view = color.create_view(&wgpu::TextureViewDescriptor::default());
        let depth_view = depth.create_view(&wgpu::TextureViewDescriptor::default());
        self.framebuffers.borrow_mut().insert(
            id,
            Framebuffer { color, color_view, depth_view, size, samples },
        );
        Some(id)
    }

    fn delete_framebuffer(&self, id: FramebufferId) {
        if self.bound.get() == Some(id) {
            self.bound.set(None);
        }
        self.framebuffers.borrow_mut().remove(&id);
    }

    fn is_framebuffer_valid(&self, id: FramebufferId) -> bool {
        self.framebuffers.borrow().contains_key(&id)
    }

    fn framebuffer_size(&self, id: FramebufferId) -> Option<PhysicalSize> {
        self.framebuffers.borrow().get(&id).map(|fb| fb.size)
    }

    fn bind(&self, id: FramebufferId) -> bool {
        if !self.is_framebuffer_valid(id) {
            return false;
        }
        self.bound.set(Some(id));
        true
    }

    fn release(&self, id: FramebufferId) {
        if self.bound.get() == Some(id) {
            self.bound.set(None);
        }
    }

    fn is_bound(&self, id: FramebufferId) -> bool {
        self.bound.get() == Some(id)
    }

    fn clear_color_depth(&self, id: FramebufferId, color: Color) {
        let framebuffers = self.framebuffers.borrow();
        if let Some(fb) = framebuffers.get(&id) {
            self.clear_pass(fb, color);
        }
    }

    fn resolve(&self, dst: FramebufferId, src: FramebufferId) -> bool {
        let framebuffers = self.framebuffers.borrow();
        let (Some(src_fb), Some(dst_fb)) = (framebuffers.get(&src), framebuffers.get(&dst))
        else {
            return false;
        };
        if dst_fb.samples != 1 || src_fb.size != dst_fb.size {
            return false;
        }

        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor { label: Some("resolve") });
        if src_fb.samples == 1 {
            encoder.copy_texture_to_texture(
                src_fb.color.as_image_copy(),
                dst_fb.color.as_image_copy(),
                wgpu::Extent3d {
                    width: src_fb.size.width,
                    height: src_fb.size.height,
                    depth_or_array_layers: 1,
                },
            );
        } else {
            // an empty pass with a resolve target performs the msaa resolve
            let _pass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
                label: Some("resolve"),
                color_attachments: &[Some(wgpu::RenderPassColorAttachment {
                    view: &src_fb.color_view,
                    resolve_target: Some(&dst_fb.color_view),
                    ops: wgpu::Operations {
                        load: wgpu::LoadOp::Load,
                        store: wgpu::StoreOp::Store,
                    },
                })],
                depth_stencil_attachment: None,
                timestamp_writes: None,
                occlusion_query_set: None,
            });
            drop(_pass);
        }
        self.queue.submit(Some(encoder.finish()));
        true
    }

    fn composite(&self, dst: FramebufferId, src: FramebufferId) -> bool {
        let framebuffers = self.framebuffers.borrow();
        let (Some(src_fb), Some(dst_fb)) = (framebuffers.get(&src), framebuffers.get(&dst))
        else {
            return false;
        };
        if src_fb.samples != 1 || dst_fb.samples != 1 {
            return false;
        }

        let bind_group = self.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("composite"),
            layout: &self.composite_layout,
            entries: &[
                wgpu::BindGroupEntry {
                    binding: 0,
                    resource: wgpu::BindingResource::TextureView(&src_fb.color_view),
                },
                wgpu::BindGroupEntry {
                    binding: 1,
                    resource: wgpu::BindingResource::Sampler(&self.sampler),
                },
            ],
        });

        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor { label: Some("composite") });
        {
            let mut pass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
                label: Some("composite"),
                color_attachments: &[Some(wgpu::RenderPassColorAttachment {
                    view: &dst_fb.color_view,
                    resolve_target: None,
                    ops: wgpu::Operations {
                        load: wgpu::LoadOp::Load,
                        store: wgpu::StoreOp::Store,
                    },
                })],
                depth_stencil_attachment: None,
                timestamp_writes: None,
                occlusion_query_set: None,
            });
            pass.set_pipeline(&self.composite_pipeline);
            pass.set_bind_group(0, &bind_group, &[]);
            pass.draw(0..3, 0..1);
        }
        self.queue.submit(Some(encoder.finish()));
        true
    }

    fn read_pixels_into(&self, id: FramebufferId, image: &mut RgbaImage) -> bool {
        let framebuffers = self.framebuffers.borrow();
        let Some(fb) = framebuffers.get(&id) else { return false };
        if image.size() != fb.size {
            return false;
        }

        // buffer rows must be 256-byte aligned for the copy
        let unpadded = fb.size.width as usize * 4;
        let padded = unpadded.div_ceil(256) * 256;
        let staging = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("readback"),
            size: (padded * fb.size.height as usize) as u64,
            usage: wgpu::BufferUsages::COPY_DST | wgpu::BufferUsages::MAP_READ,
            mapped_at_creation: false,
        });

        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor { label: Some("readback") });

        // multisampled content cannot be copied directly; resolve into a
        // transient single-sample texture and read that back instead
        let resolved;
        let source = if fb.samples == 1 {
            &fb.color
        } else {
            resolved = self.device.create_texture(&wgpu::TextureDescriptor {
                label: Some("readback resolve"),
                size: wgpu::Extent3d {
                    width: fb.size.width,
                    height: fb.size.height,
                    depth_or_array_layers: 1,
                },
                mip_level_count: 1,
                sample_count: 1,
                dimension: wgpu::TextureDimension::D2,
                format: COLOR_FORMAT,
                usage: wgpu::TextureUsages::RENDER_ATTACHMENT | wgpu::TextureUsages::COPY_SRC,
                view_formats: &[],
            });
            let resolved_view = resolved.create_view(&wgpu::TextureViewDescriptor::default());
            let _pass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
                label: Some("readback resolve"),
                color_attachments: &[Some(wgpu::RenderPassColorAttachment {
                    view: &fb.color_view,
                    resolve_target: Some(&resolved_view),
                    ops: wgpu::Operations {
                        load: wgpu::LoadOp::Load,
                        store: wgpu::StoreOp::Store,
                    },
                })],
                depth_stencil_attachment: None,
                timestamp_writes: None,
                occlusion_query_set: None,
            });
            drop(_pass);
            &resolved
        };
        encoder.copy_texture_to_buffer(
            source.as_image_copy(),
            wgpu::TexelCopyBufferInfo {
                buffer: &staging,
                layout: wgpu::TexelCopyBufferLayout {
                    offset: 0,
                    bytes_per_row: Some(padded as u32),
                    rows_per_image: None,
                },
            },
            wgpu::Extent3d {
                width: fb.size.width,
                height: fb.size.height,
                depth_or_array_layers: 1,
            },
        );
        self.queue.submit(Some(encoder.finish()));

        let slice = staging.slice(..);
        let (sender, receiver) = futures_intrusive::channel::shared::oneshot_channel();
        slice.map_async(wgpu::MapMode::Read, move |result| {
            let _ = sender.send(result);
        });
        self.device.poll(wgpu::Maintain::Wait);
        match pollster::block_on(receiver.receive()) {
            Some(Ok(())) => {}
            _ => return false,
        }

        {
            let data = slice.get_mapped_range();
            for y in 0..fb.size.height as usize {
                let src = &data[y * padded..y * padded + unpadded];
                let offset = y * image.stride as usize;
                image.pixels[offset..offset + unpadded].copy_from_slice(src);
            }
        }
        staging.unmap();
        true
    }
}

/// Off-screen paint device on a wgpu context. Carries the extents and scale
/// the host's renderer targets; the actual drawing goes through whatever
/// scene renderer the host runs on the shared device.
#[derive(Debug)]
pub struct WgpuPaintDevice {
    size: Cell<PhysicalSize>,
    device_pixel_ratio: Cell<f64>,
}

impl WgpuPaintDevice {
    pub fn new(size: PhysicalSize) -> Rc<Self> {
        Rc::new(Self { size: Cell::new(size), device_pixel_ratio: Cell::new(1.0) })
    }
}

impl GpuPaintDevice for WgpuPaintDevice {
    fn size(&self) -> PhysicalSize {
        self.size.get()
    }

    fn set_size(&self, size: PhysicalSize) {
        self.size.set(size);
    }

    fn device_pixel_ratio(&self) -> f64 {
        self.device_pixel_ratio.get()
    }

    fn set_device_pixel_ratio(&self, ratio: f64) {
        self.device_pixel_ratio.set(ratio);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::fbo::FboPaintBuffer;
    use crate::buffer::PaintBuffer;
    use crate::geometry::Size;
    use crate::image::PixelSurface;
    use crate::painter::SurfacePainter;

    /// Tests skip silently on machines without a usable adapter.
    fn gpu(samples: u32) -> Option<Rc<WgpuGpu>> {
        let _ = env_logger::builder().is_test(true).try_init();
        WgpuGpu::from_default_adapter(samples).ok()
    }

    #[test]
    fn clear_and_read_back() {
        let Some(gpu) = gpu(1) else { return };
        let id = gpu.create_framebuffer(PhysicalSize::new(4, 4), 1).unwrap();
        gpu.clear_color_depth(id, Color::from_u8(0, 0, 255, 255));
        let image = gpu.read_pixels(id).unwrap();
        assert_eq!(image.pixel(0, 0), [0, 0, 255, 255]);
        assert_eq!(image.pixel(3, 3), [0, 0, 255, 255]);
    }

    #[test]
    fn zero_sized_framebuffers_are_rejected() {
        let Some(gpu) = gpu(1) else { return };
        assert!(gpu.create_framebuffer(PhysicalSize::new(0, 4), 1).is_none());
    }

    #[test]
    fn multisampled_source_resolves_into_single_sample() {
        let Some(gpu) = gpu(4) else { return };
        let msaa = gpu.create_framebuffer(PhysicalSize::new(8, 8), 4).unwrap();
        let plain = gpu.create_framebuffer(PhysicalSize::new(8, 8), 1).unwrap();
        gpu.clear_color_depth(msaa, Color::from_u8(255, 0, 0, 255));
        assert!(gpu.resolve(plain, msaa));
        let image = gpu.read_pixels(plain).unwrap();
        assert_eq!(image.pixel(4, 4), [255, 0, 0, 255]);
    }

    #[test]
    fn composite_blends_source_over() {
        let Some(gpu) = gpu(1) else { return };
        let dst = gpu.create_framebuffer(PhysicalSize::new(4, 4), 1).unwrap();
        let src = gpu.create_framebuffer(PhysicalSize::new(4, 4), 1).unwrap();
        gpu.clear_color_depth(dst, Color::from_u8(255, 255, 255, 255));
        gpu.clear_color_depth(src, Color::new(1.0, 0.0, 0.0, 0.5));
        assert!(gpu.composite(dst, src));
        let px = gpu.read_pixels(dst).unwrap().pixel(1, 1);
        assert_eq!(px[0], 255);
        assert!((px[1] as i32 - 127).abs() <= 2, "expected half-blended channel, got {px:?}");
    }

    #[test]
    fn multisampled_framebuffer_reads_back() {
        let Some(gpu) = gpu(4) else { return };
        let id = gpu.create_framebuffer(PhysicalSize::new(8, 8), 4).unwrap();
        gpu.clear_color_depth(id, Color::from_u8(255, 0, 0, 255));
        let image = gpu.read_pixels(id).expect("multisampled readback resolves internally");
        assert_eq!(image.pixel(0, 0), [255, 0, 0, 255]);
        assert_eq!(image.pixel(7, 7), [255, 0, 0, 255]);
    }

    /// The clear-then-draw round trip on a multisampled context: the buffer's
    /// framebuffer picks up the context's sample count, and `draw` must still
    /// land pixels on the target painter.
    #[test]
    fn multisampled_buffer_draw_lands_pixels() {
        let Some(gpu) = gpu(4) else { return };
        let device = WgpuPaintDevice::new(PhysicalSize::new(0, 0));
        let context: Rc<dyn GpuContext> = Rc::clone(&gpu) as Rc<dyn GpuContext>;
        let paint_device: Rc<dyn GpuPaintDevice> = Rc::clone(&device) as Rc<dyn GpuPaintDevice>;
        let mut buffer = FboPaintBuffer::new(
            Size::new(8, 8),
            1.0,
            "main",
            Rc::downgrade(&context),
            Rc::downgrade(&paint_device),
        );
        buffer.clear(Color::from_u8(255, 0, 0, 255));

        let canvas = Rc::new(RefCell::new(PixelSurface::new(PhysicalSize::new(8, 8), 1.0)));
        let mut painter = SurfacePainter::new(Rc::clone(&canvas));
        painter.begin();
        buffer.draw(&mut painter);
        painter.end();

        assert_eq!(canvas.borrow().pixel(4, 4), [255, 0, 0, 255]);
        assert_eq!(canvas.borrow().pixel(7, 0), [255, 0, 0, 255]);
    }

    #[test]
    fn readback_handles_row_padding() {
        // 30 * 4 = 120 bytes per row, well below the 256-byte alignment
        let Some(gpu) = gpu(1) else { return };
        let id = gpu.create_framebuffer(PhysicalSize::new(30, 3), 1).unwrap();
        gpu.clear_color_depth(id, Color::from_u8(9, 8, 7, 255));
        let image = gpu.read_pixels(id).unwrap();
        assert_eq!(image.pixel(29, 2), [9, 8, 7, 255]);
    }
}
