//! Mapping from slot keys to kernel USB device names.
//!
//! Slot keys are udev `ID_PATH`-style strings such as
//! `platform-fd500000.pcie-pci-0000:01:00.0-usb-0:1.1.2:1.0`. The trailing
//! `usb-<bus>:<port_path>:<config.interface>` segment identifies the device
//! on the bus; the sysfs name used by `/sys/bus/usb/drivers/usb/{unbind,bind}`
//! is `<bus+1>-<port_path>`.

use thiserror::Error;

/// The kernel numbers buses from 1 while the `ID_PATH` segment counts from 0.
/// Empirically correct on Raspberry-Pi-class boards; other hosts may need a
/// different mapping, which is why the offset lives in one place.
const BUS_NUMBER_OFFSET: u32 = 1;

/// Derive the sysfs USB device name (`<bus>-<port_path>`) from a slot key.
pub fn sysfs_device_name(slot_key: &str) -> Result<String, SlotKeyError> {
    let at = slot_key
        .rfind("usb-")
        .ok_or_else(|| SlotKeyError::NoUsbSegment(slot_key.to_string()))?;
    let suffix = &slot_key[at + "usb-".len()..];

    let mut fields = suffix.split(':');
    let bus_field = fields.next().unwrap_or_default();
    let port_path = fields
        .next()
        .ok_or_else(|| SlotKeyError::MalformedSuffix(suffix.to_string()))?;
    if port_path.is_empty() {
        return Err(SlotKeyError::MalformedSuffix(suffix.to_string()));
    }

    let bus: u32 = bus_field
        .parse()
        .map_err(|_| SlotKeyError::BadBusNumber(bus_field.to_string()))?;

    Ok(format!("{}-{}", bus + BUS_NUMBER_OFFSET, port_path))
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum SlotKeyError {
    #[error("slot key {0:?} has no usb- segment")]
    NoUsbSegment(String),
    #[error("usb- suffix {0:?} is not <bus>:<port_path>[:...]")]
    MalformedSuffix(String),
    #[error("bus number {0:?} is not numeric")]
    BadBusNumber(String),
}
