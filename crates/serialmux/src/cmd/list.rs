use serialmux_device::{DeviceBackend, SerialportBackend};

use crate::cmd::ListArgs;
use crate::exit::{device_error, CliResult, SUCCESS};
use crate::output::{print_ports, OutputFormat};

pub fn run(args: ListArgs) -> CliResult<i32> {
    let ports = SerialportBackend::new()
        .enumerate()
        .map_err(|err| device_error("list failed", err))?;
    tracing::debug!(count = ports.len(), "enumerated serial ports");

    let format = args.format.unwrap_or_else(OutputFormat::default_for_stdout);
    print_ports(&ports, format);
    Ok(SUCCESS)
}
