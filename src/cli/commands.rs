use crate::cli::{Commands, OutputFormat};
use crate::clock::{BootClock, FixedBootClock, SystemBootClock};
use crate::ebpf::btf::{KernelEnumTable, KernelTypes, NoKernelTypes, Type, TypeCatalog};
use crate::ebpf::decode::decode;
use crate::ebpf::events::Event;
use crate::ebpf::loader::{BundleLoader, InfoProvider};
use crate::ebpf::plan::{DecodePlan, EndpointKind};
use crate::ebpf::snapshot::split_records;
use anyhow::{Context, Result};
use bytes::Bytes;
use std::path::{Path, PathBuf};
use std::time::{Duration, UNIX_EPOCH};
use tracing::info;

pub async fn handle_command(command: Commands) -> Result<()> {
    match command {
        Commands::Plan {
            bundle,
            kernel_types,
            format,
        } => handle_plan(bundle, kernel_types, format).await,
        Commands::Decode {
            bundle,
            input,
            kernel_types,
            boot_time,
            format,
        } => handle_decode(bundle, input, kernel_types, boot_time, format).await,
    }
}

async fn load_kernel_types(path: Option<PathBuf>) -> Result<Box<dyn KernelTypes>> {
    let Some(path) = path else {
        return Ok(Box::new(NoKernelTypes));
    };

    let data = tokio::fs::read(&path)
        .await
        .with_context(|| format!("Failed to read kernel types from {}", path.display()))?;
    let catalog = TypeCatalog::from_json(&data)?;
    let mut table = KernelEnumTable::new();
    for ty in catalog.types {
        if let Type::Enum(e) = ty {
            table.insert(e);
        }
    }
    Ok(Box::new(table))
}

async fn handle_plan(
    bundle: PathBuf,
    kernel_types: Option<PathBuf>,
    format: OutputFormat,
) -> Result<()> {
    let info = BundleLoader::new(bundle).probe_info().await?;
    let kernel_types = load_kernel_types(kernel_types).await?;
    let (plan, warnings) = info.compile_plan(kernel_types.as_ref())?;

    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&plan)?),
        OutputFormat::Text => {
            print!("{}", format_plan(&plan));
            for warning in &warnings {
                println!("warning: {}", warning);
            }
        }
    }
    Ok(())
}

async fn handle_decode(
    bundle: PathBuf,
    input: PathBuf,
    kernel_types: Option<PathBuf>,
    boot_time: Option<u64>,
    format: OutputFormat,
) -> Result<()> {
    let info = BundleLoader::new(bundle).probe_info().await?;
    let kernel_types = load_kernel_types(kernel_types).await?;
    let (plan, _) = info.compile_plan(kernel_types.as_ref())?;

    let clock: Box<dyn BootClock> = match boot_time {
        Some(secs) => Box::new(FixedBootClock::new(UNIX_EPOCH + Duration::from_secs(secs))),
        None => Box::new(SystemBootClock),
    };

    let data = read_input(&input).await?;
    let records = split_records(data, plan.record_size);
    info!("Decoding {} records from {}", records.len(), input.display());

    for record in records {
        let event = decode(&plan, record, &info.factory, clock.as_ref());
        match format {
            OutputFormat::Json => println!("{}", serde_json::to_string(&event)?),
            OutputFormat::Text => println!("{}", format_event(&event)),
        }
    }
    Ok(())
}

async fn read_input(path: &Path) -> Result<Bytes> {
    let data = tokio::fs::read(path)
        .await
        .with_context(|| format!("Failed to read records from {}", path.display()))?;
    Ok(Bytes::from(data))
}

pub fn format_plan(plan: &DecodePlan) -> String {
    let mut out = format!("record size: {}\n", plan.record_size);
    match plan.mntns_id {
        Some(offset) => out.push_str(&format!("mntns id:    @{}\n", offset)),
        None => out.push_str("mntns id:    -\n"),
    }
    for field in &plan.endpoints {
        let kind = match field.kind {
            EndpointKind::L3 => "l3",
            EndpointKind::L4 => "l4",
        };
        out.push_str(&format!("endpoint:    {} @{} ({})\n", field.name, field.offset, kind));
    }
    for offset in &plan.timestamps {
        out.push_str(&format!("timestamp:   @{}\n", offset));
    }
    for field in &plan.enums {
        out.push_str(&format!(
            "enum:        {} @{} ({} bytes, {} values)\n",
            field.name,
            field.offset,
            field.reader.width.bytes(),
            field.values.len()
        ));
    }
    out
}

pub fn format_event(event: &Event) -> String {
    let mut parts = vec![format!("mntns={}", event.mntns_id)];
    if let Some(netns) = event.netns_id {
        parts.push(format!("netns={}", netns));
    }
    for ep in &event.l3_endpoints {
        parts.push(format!("{}={}", ep.name, ep.addr));
    }
    for ep in &event.l4_endpoints {
        parts.push(format!("{}={}:{}/{}", ep.name, ep.addr, ep.port, ep.protocol()));
    }
    for (name, value) in &event.fields {
        parts.push(format!("{}={}", name, value));
    }
    parts.join(" ")
}
