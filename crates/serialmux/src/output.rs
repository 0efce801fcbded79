use std::io::IsTerminal;

use clap::ValueEnum;
use comfy_table::{presets::UTF8_FULL, ContentArrangement, Table};
use serde::Serialize;
use serialmux_device::{PortDescriptor, PortKind};

#[derive(Clone, Debug, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    Json,
    Table,
}

impl OutputFormat {
    pub fn default_for_stdout() -> Self {
        if std::io::stdout().is_terminal() {
            Self::Table
        } else {
            Self::Json
        }
    }
}

#[derive(Serialize)]
struct PortListOutput<'a> {
    count: usize,
    ports: &'a [PortDescriptor],
}

pub fn print_ports(ports: &[PortDescriptor], format: OutputFormat) {
    match format {
        OutputFormat::Json => {
            let out = PortListOutput {
                count: ports.len(),
                ports,
            };
            println!(
                "{}",
                serde_json::to_string(&out).unwrap_or_else(|_| "{}".to_string())
            );
        }
        OutputFormat::Table => println!("{}", port_table(ports)),
    }
}

fn port_table(ports: &[PortDescriptor]) -> Table {
    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec!["PATH", "TYPE", "VID:PID", "SERIAL", "PRODUCT"]);

    for port in ports {
        let ids = match (port.vendor_id, port.product_id) {
            (Some(vid), Some(pid)) => format!("{vid:04x}:{pid:04x}"),
            _ => "-".to_string(),
        };
        let product = match (&port.manufacturer, &port.product) {
            (Some(maker), Some(product)) => format!("{maker} {product}"),
            (Some(name), None) | (None, Some(name)) => name.clone(),
            (None, None) => "-".to_string(),
        };
        table.add_row(vec![
            port.path.clone(),
            kind_label(port.kind).to_string(),
            ids,
            port.serial_number.clone().unwrap_or_else(|| "-".to_string()),
            product,
        ]);
    }
    table
}

fn kind_label(kind: PortKind) -> &'static str {
    match kind {
        PortKind::Usb => "usb",
        PortKind::Pci => "pci",
        PortKind::Bluetooth => "bluetooth",
        PortKind::Unknown => "unknown",
    }
}
