use std::env;

use primnet::engine::{PoolingEngine, TensorMaterializer};
use primnet::kernel::{KernelSlot, OpKernel};
use primnet::pooling::{build_backward, build_forward, PoolingSpec};
use primnet::spec::{
    pooled_output_dims, DType, Dims, LayoutRole, MemFormat, MemoryDesc, PoolKind, PropKind,
};
use primnet_engine_ref_cpu::{CpuEngine, PrimitiveKind};
use serde::Serialize;

#[derive(Serialize)]
struct SlotReport {
    role: LayoutRole,
    dims: Dims,
    dtype: DType,
    format: MemFormat,
    #[serde(skip_serializing_if = "Option::is_none")]
    reorder_to: Option<MemFormat>,
}

#[derive(Serialize)]
struct PlanReport {
    engine: String,
    direction: PropKind,
    kind: PoolKind,
    dtype: DType,
    src_dims: Dims,
    dst_dims: Dims,
    window: Dims,
    strides: Dims,
    padding: Dims,
    requested_layout: Option<MemFormat>,
    descriptor_layout: MemFormat,
    fallback: bool,
    workspace: bool,
    inputs: Vec<SlotReport>,
    outputs: Vec<SlotReport>,
    net: Vec<String>,
}

fn main() {
    if let Err(err) = run() {
        eprintln!("error: {err}");
        std::process::exit(1);
    }
}

fn run() -> Result<(), String> {
    let mut args = env::args().skip(1);
    let Some(cmd) = args.next() else {
        print_help();
        return Ok(());
    };

    match cmd.as_str() {
        "--help" | "-h" | "help" => {
            print_help();
            Ok(())
        }
        "version" | "--version" | "-V" => {
            println!("poolplan 0.1.0");
            Ok(())
        }
        "plan" => run_plan(args.collect()),
        other => Err(format!("unknown command '{other}'")),
    }
}

fn run_plan(raw_args: Vec<String>) -> Result<(), String> {
    let mut src: Option<Dims> = None;
    let mut window: Option<Dims> = None;
    let mut stride: Option<Dims> = None;
    let mut pad: Option<Dims> = None;
    let mut kind: Option<PoolKind> = None;
    let mut dtype = DType::F32;
    let mut layout: Option<MemFormat> = None;
    let mut backward = false;

    let mut i = 0usize;
    while i < raw_args.len() {
        match raw_args[i].as_str() {
            "--src" => {
                i += 1;
                src = Some(parse_dims(required(&raw_args, i, "--src")?)?);
            }
            "--window" => {
                i += 1;
                window = Some(parse_dims(required(&raw_args, i, "--window")?)?);
            }
            "--stride" => {
                i += 1;
                stride = Some(parse_dims(required(&raw_args, i, "--stride")?)?);
            }
            "--pad" => {
                i += 1;
                pad = Some(parse_dims(required(&raw_args, i, "--pad")?)?);
            }
            "--kind" => {
                i += 1;
                kind = Some(parse_kind(required(&raw_args, i, "--kind")?)?);
            }
            "--dtype" => {
                i += 1;
                dtype = parse_dtype(required(&raw_args, i, "--dtype")?)?;
            }
            "--layout" => {
                i += 1;
                layout = Some(parse_format(required(&raw_args, i, "--layout")?)?);
            }
            "--backward" => backward = true,
            flag => return Err(format!("unknown plan flag '{flag}'")),
        }
        i += 1;
    }

    let src = src.ok_or_else(|| "missing required --src".to_string())?;
    let window = window.ok_or_else(|| "missing required --window".to_string())?;
    let stride = stride.ok_or_else(|| "missing required --stride".to_string())?;
    let pad = pad.ok_or_else(|| "missing required --pad".to_string())?;
    let kind = kind.ok_or_else(|| "missing required --kind".to_string())?;

    let dst = pooled_output_dims(&src, &window, &stride, &pad)
        .map_err(|err| format!("invalid pooling parameters: {err}"))?;

    let spec = PoolingSpec {
        kind,
        dtype,
        src_dims: src,
        dst_dims: dst,
        window,
        strides: stride,
        padding: pad,
    };

    let engine = CpuEngine::new();
    let kernel = if backward {
        let forward = build_forward(&engine, &spec, None)
            .map_err(|err| format!("forward build failed: {err}"))?;
        let requested = layout.map(|format| {
            MemoryDesc::new(spec.dst_dims.clone(), spec.dtype, format)
        });
        build_backward(&engine, &spec, requested.as_ref(), &forward)
            .map_err(|err| format!("backward build failed: {err}"))?
    } else {
        let requested = layout.map(|format| {
            MemoryDesc::new(spec.src_dims.clone(), spec.dtype, format)
        });
        build_forward(&engine, &spec, requested.as_ref())
            .map_err(|err| format!("forward build failed: {err}"))?
    };

    let report = plan_report(&engine, &spec, &kernel, layout);
    let json = serde_json::to_string_pretty(&report)
        .map_err(|err| format!("failed to encode plan report: {err}"))?;
    println!("{json}");
    Ok(())
}

fn plan_report(
    engine: &CpuEngine,
    spec: &PoolingSpec,
    kernel: &OpKernel<CpuEngine>,
    requested: Option<MemFormat>,
) -> PlanReport {
    let descriptor_layout = kernel.descriptor().src().format;
    // The read-side format of the kept descriptor tells which instantiation
    // won: anything other than the caller's exact layout means the fixed
    // default was used.
    let fallback = match requested {
        Some(format) => descriptor_layout != format,
        None => true,
    };

    PlanReport {
        engine: engine.engine_name().to_string(),
        direction: kernel.descriptor().prop(),
        kind: spec.kind,
        dtype: spec.dtype,
        src_dims: spec.src_dims.clone(),
        dst_dims: spec.dst_dims.clone(),
        window: spec.window.clone(),
        strides: spec.strides.clone(),
        padding: spec.padding.clone(),
        requested_layout: requested,
        descriptor_layout,
        fallback,
        workspace: kernel.workspace_output().is_some() || kernel.workspace_input().is_some(),
        inputs: kernel.inputs().iter().map(|s| slot_report(engine, s)).collect(),
        outputs: kernel.outputs().iter().map(|s| slot_report(engine, s)).collect(),
        net: kernel
            .net()
            .iter()
            .map(|primitive| match primitive.kind() {
                PrimitiveKind::Pooling => "pooling".to_string(),
                PrimitiveKind::Reorder => "reorder".to_string(),
            })
            .collect(),
    }
}

fn slot_report(engine: &CpuEngine, slot: &KernelSlot<CpuEngine>) -> SlotReport {
    let desc = engine.memory_desc(slot.tensor());
    SlotReport {
        role: slot.role(),
        dims: desc.dims,
        dtype: desc.dtype,
        format: desc.format,
        reorder_to: slot
            .conversion()
            .map(|conversion| engine.memory_desc(conversion.internal()).format),
    }
}

fn required<'a>(args: &'a [String], index: usize, flag: &str) -> Result<&'a str, String> {
    args.get(index)
        .map(String::as_str)
        .ok_or_else(|| format!("{flag} needs a value"))
}

fn parse_dims(text: &str) -> Result<Dims, String> {
    let mut dims = Dims::new();
    for part in text.split('x') {
        let value: usize = part
            .parse()
            .map_err(|_| format!("invalid dimension '{part}' in '{text}'"))?;
        dims.push(value);
    }
    Ok(dims)
}

fn parse_kind(text: &str) -> Result<PoolKind, String> {
    match text.to_ascii_lowercase().as_str() {
        "max" => Ok(PoolKind::Max),
        "avg" => Ok(PoolKind::Avg),
        other => Err(format!("unknown pooling kind '{other}' (max, avg)")),
    }
}

fn parse_dtype(text: &str) -> Result<DType, String> {
    match text.to_ascii_lowercase().as_str() {
        "f32" => Ok(DType::F32),
        "si32" => Ok(DType::Si32),
        "si8" => Ok(DType::Si8),
        "ui8" => Ok(DType::Ui8),
        other => Err(format!("unknown dtype '{other}' (f32, si32, si8, ui8)")),
    }
}

fn parse_format(text: &str) -> Result<MemFormat, String> {
    match text.to_ascii_lowercase().as_str() {
        "nchw" => Ok(MemFormat::Nchw),
        "nhwc" => Ok(MemFormat::Nhwc),
        "chwn" => Ok(MemFormat::Chwn),
        "nchw8c" => Ok(MemFormat::NChw8c),
        other => Err(format!(
            "unknown layout '{other}' (nchw, nhwc, chwn, nchw8c)"
        )),
    }
}

fn print_help() {
    println!("poolplan 0.1.0");
    println!("Usage:");
    println!("  poolplan plan --src 1x3x8x8 --window 2x2 --stride 2x2 --pad 0x0 --kind max");
    println!("                [--dtype f32] [--layout nchw] [--backward]");
    println!("  poolplan version");
    println!();
    println!("Builds a pooling kernel against the reference CPU engine and prints");
    println!("the negotiated plan as JSON: committed layouts, conversions, and the");
    println!("ordered primitive net.");
}
