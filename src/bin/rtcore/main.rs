//! rtcore CLI - Inspect the host device and render the demo scene.

use std::env;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use glam::{Mat4, Vec3};
use parking_lot::RwLock;
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

use rtcore::device::host::HostDevice;
use rtcore::device::{is_hardware_ray_tracing_supported, DeviceRef};
use rtcore::records::{BatchState, FrameConstants, GpuRecord, InstanceRecord, LightRecord, MaterialRecord};
use rtcore::render::{OutputKind, ProgressiveRenderer, RenderOutcome, RenderParams, RendererConfig};
use rtcore::scene::{quad_geometry, Camera, LightDesc, MaterialStore, MeshBuffers, SceneSnapshot};
use surface_params::{MaterialType, SurfaceParams};

fn main() {
    let args: Vec<String> = env::args().collect();

    // Parse global flags
    let mut level = "info";
    let mut filtered_args: Vec<&str> = Vec::new();
    for arg in &args[1..] {
        match arg.as_str() {
            "-v" | "--verbose" => level = "debug",
            "-vv" | "--trace" => level = "trace",
            "-q" | "--quiet" => level = "error",
            _ => filtered_args.push(arg),
        }
    }
    let _guard = init_tracing(level);

    if filtered_args.is_empty() {
        print_usage(&args[0]);
        return;
    }

    let result = match filtered_args[0] {
        "info" | "i" => cmd_info(),
        "render" | "r" => cmd_render(&filtered_args[1..]),
        "--version" | "-V" => {
            println!("rtcore {} ({} {})", env!("CARGO_PKG_VERSION"), rtcore::BUILD_DATE, rtcore::BUILD_TIME);
            Ok(())
        }
        "help" | "h" | "-h" | "--help" => {
            print_usage(&args[0]);
            Ok(())
        }
        other => {
            eprintln!("Unknown command: {other}");
            print_usage(&args[0]);
            std::process::exit(1);
        }
    };

    if let Err(e) = result {
        eprintln!("Error: {e:#}");
        if let Some(hint) = e.downcast_ref::<rtcore::Error>().and_then(|e| e.remediation()) {
            eprintln!("Hint: {hint}");
        }
        std::process::exit(1);
    }
}

/// Console logging, plus a Chrome trace (`trace.json`) when `RTCORE_TRACE=1`.
fn init_tracing(level: &str) -> Option<tracing_chrome::FlushGuard> {
    let filter = EnvFilter::try_from_env("RTCORE_LOG").unwrap_or_else(|_| EnvFilter::new(level));
    let fmt = tracing_subscriber::fmt::layer().with_target(false);

    let (chrome, guard) = if env::var("RTCORE_TRACE").ok().as_deref() == Some("1") {
        let (layer, guard) = tracing_chrome::ChromeLayerBuilder::new().file("trace.json").build();
        (Some(layer), Some(guard))
    } else {
        (None, None)
    };

    let subscriber = tracing_subscriber::registry().with(filter).with(fmt).with(chrome);
    if tracing::subscriber::set_global_default(subscriber).is_err() {
        return None;
    }
    guard
}

fn print_usage(prog: &str) {
    println!("rtcore CLI - Progressive path tracing on the host device");
    println!();
    println!("Usage: {prog} [options] <command> [render options]");
    println!();
    println!("Commands:");
    println!("  i, info      Show device capabilities and record strides");
    println!("  r, render    Render the demo scene");
    println!("  h, help      Show this help");
    println!("  --version    Show version and build date");
    println!();
    println!("Render options:");
    println!("  -o <file>         Output image (default render.png)");
    println!("  --samples <n>     Samples per pixel (multiple of --batch)");
    println!("  --batch <n>       Samples per batch");
    println!("  --depth <n>       Maximum path depth");
    println!("  --size <WxH>      Image size");
    println!("  --exposure <f>    Exposure for LDR output");
    println!("  --denoise         Denoise with albedo/normal guides");
    println!("  --hdr             Write linear HDR (.exr or .hdr)");
    println!("  --all             Also write radiance/albedo/normal .exr files");
    println!("  --config <json>   Renderer config (default: user config dir)");
    println!();
    println!("Options:");
    println!("  -v, --verbose  Debug output");
    println!("  -vv, --trace   Trace output (very verbose)");
    println!("  -q, --quiet    Errors only");
    println!();
    println!("Environment:");
    println!("  RTCORE_LOG     Log filter, overrides -v/-q");
    println!("  RTCORE_TRACE=1 Write a Chrome trace to trace.json");
}

fn cmd_info() -> Result<()> {
    let device = HostDevice::default();
    let caps = rtcore::device::RayTracingDevice::capabilities(&device);

    println!("Device: {}", caps.name);
    println!("Hardware ray tracing: {}", is_hardware_ray_tracing_supported(&device));
    println!("  Max recursion depth:  {}", caps.max_ray_recursion_depth);
    println!("  Group handle size:    {}", caps.shader_group_handle_size);
    println!("  Handle alignment:     {}", caps.shader_group_handle_alignment);
    println!("  Base alignment:       {}", caps.shader_group_base_alignment);
    println!("  Storage offset align: {}", caps.min_storage_buffer_offset_alignment);
    println!("  Row pitch alignment:  {}", caps.optimal_row_pitch_alignment);
    println!("  Storage formats:      {:?}", caps.storage_image_formats);
    println!();
    println!("Records:");
    print_record::<MaterialRecord>();
    print_record::<InstanceRecord>();
    print_record::<LightRecord>();
    println!("  {:<16} {:>4} bytes", "BatchState", std::mem::size_of::<BatchState>());
    println!("  {:<16} {:>4} bytes", "FrameConstants", std::mem::size_of::<FrameConstants>());
    Ok(())
}

fn print_record<T: GpuRecord>() {
    println!("  {:<16} {:>4} bytes", T::NAME, T::WIRE_SIZE);
}

fn cmd_render(args: &[&str]) -> Result<()> {
    let mut params = RenderParams::default();
    let mut config_path: Option<PathBuf> = None;

    let mut it = args.iter();
    while let Some(&arg) = it.next() {
        let mut value = || it.next().copied().with_context(|| format!("{arg} needs a value"));
        match arg {
            "-o" | "--output" => params.output = PathBuf::from(value()?),
            "--samples" => params.samples = value()?.parse().context("--samples")?,
            "--batch" => params.batch_size = value()?.parse().context("--batch")?,
            "--depth" => params.max_depth = value()?.parse().context("--depth")?,
            "--exposure" => params.exposure = value()?.parse().context("--exposure")?,
            "--size" => {
                let (w, h) = parse_size(value()?)?;
                params.width = w;
                params.height = h;
            }
            "--denoise" => params.denoise = true,
            "--hdr" => params.output_kind = OutputKind::Hdr,
            "--all" => params.write_all_intermediate = true,
            "--config" => config_path = Some(PathBuf::from(value()?)),
            other => bail!("unknown render option: {other}"),
        }
    }
    if params.output_kind == OutputKind::Hdr && params.output.extension().is_some_and(|e| e == "png") {
        params.output.set_extension("exr");
    }

    let config = load_config(config_path.as_deref())?;
    let device: DeviceRef = Arc::new(HostDevice::default());
    let renderer = ProgressiveRenderer::new(device.clone(), config).context("renderer setup")?;
    let scene = demo_scene(&device, renderer.config())?;

    println!(
        "Rendering {}x{}, {} spp in batches of {}...",
        params.width, params.height, params.samples, params.batch_size
    );
    match renderer.render(&scene, &params)? {
        RenderOutcome::Completed(report) => {
            println!("Done in {:.2?}", report.elapsed);
            for file in &report.files {
                println!("  {}", file.display());
            }
        }
        RenderOutcome::Ignored => println!("Render already in progress"),
    }
    Ok(())
}

fn parse_size(s: &str) -> Result<(u32, u32)> {
    let (w, h) = s.split_once(&['x', 'X'][..]).with_context(|| format!("size '{s}' is not WxH"))?;
    Ok((w.parse().context("width")?, h.parse().context("height")?))
}

/// Explicit path, else `<config dir>/rtcore/config.json` if present, else defaults.
fn load_config(path: Option<&Path>) -> Result<RendererConfig> {
    if let Some(path) = path {
        return RendererConfig::load(path).with_context(|| format!("loading {}", path.display()));
    }
    let user = dirs::config_dir().map(|p| p.join("rtcore").join("config.json"));
    match user {
        Some(p) if p.exists() => {
            tracing::debug!(path = %p.display(), "using user config");
            RendererConfig::load(&p).with_context(|| format!("loading {}", p.display()))
        }
        _ => Ok(RendererConfig::default()),
    }
}

/// A lit quad: one mesh, one Lambert material, one point light.
fn demo_scene(device: &DeviceRef, config: &RendererConfig) -> Result<SceneSnapshot> {
    let mut materials = MaterialStore::new(device, config.material_capacity, config.frames_in_flight)?;
    let red = materials.create(MaterialType::Lambert, SurfaceParams::lambert(Vec3::new(0.8, 0.2, 0.2)))?;

    let (vertices, indices) = quad_geometry(2.0);
    let quad = MeshBuffers::upload(device, "quad", &vertices, &indices, Mat4::IDENTITY)?;

    let camera = Camera::look_at(Vec3::new(0.0, 0.0, 3.0), Vec3::ZERO);
    let mut scene = SceneSnapshot::new(Arc::new(RwLock::new(materials)), camera);
    scene.add_object(&quad, red, Mat4::IDENTITY);
    scene.add_light(LightDesc::Point {
        position: Vec3::new(0.5, 0.5, 2.0),
        color: Vec3::ONE,
        intensity: 6.0,
    });
    Ok(scene)
}
