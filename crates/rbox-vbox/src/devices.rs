//! USB device filters and shared folders.

use crate::error::VboxResult;
use crate::task::Task;
use crate::transport::Args;
use crate::types::{yes_no, SharedFolder, UsbFilter};
use crate::vm::{mutate, Check, VmContext};
use log::info;

// ─── usbfilter ───────────────────────────────────────────────────────

fn filter_fields(args: Args, filter: &UsbFilter) -> Args {
    let args = args
        .flag("--name", &filter.name)
        .flag("--active", yes_no(filter.active));
    [
        ("--vendorid", &filter.vendor_id),
        ("--productid", &filter.product_id),
        ("--revision", &filter.revision),
        ("--manufacturer", &filter.manufacturer),
        ("--product", &filter.product),
        ("--serialnumber", &filter.serial_number),
        ("--remote", &filter.remote),
    ]
    .into_iter()
    .filter(|(_, value)| !value.is_empty())
    .fold(args, |args, (flag, value)| args.flag(flag, value))
}

pub fn usb_filter_add_args(uuid: &str, index: u32, filter: &UsbFilter) -> Args {
    filter_fields(
        Args::new("usbfilter").arg("add").arg(index).flag("--target", uuid),
        filter,
    )
}

pub fn usb_filter_modify_args(uuid: &str, index: u32, filter: &UsbFilter) -> Args {
    filter_fields(
        Args::new("usbfilter").arg("modify").arg(index).flag("--target", uuid),
        filter,
    )
}

pub fn usb_filter_remove_args(uuid: &str, index: u32) -> Args {
    Args::new("usbfilter").arg("remove").arg(index).flag("--target", uuid)
}

// ─── sharedfolder ────────────────────────────────────────────────────

pub fn shared_folder_add_args(uuid: &str, folder: &SharedFolder) -> Args {
    Args::new("sharedfolder")
        .arg("add")
        .arg(uuid)
        .flag("--name", &folder.name)
        .flag("--hostpath", &folder.host_path)
        .switch("--readonly", folder.read_only)
        .switch("--automount", folder.auto_mount)
}

pub fn shared_folder_remove_args(uuid: &str, name: &str) -> Args {
    Args::new("sharedfolder").arg("remove").arg(uuid).flag("--name", name)
}

// ─── Device Manager ──────────────────────────────────────────────────

pub struct DeviceManager;

impl DeviceManager {
    pub async fn add_usb_filter(ctx: &VmContext, index: u32, filter: &UsbFilter) -> VboxResult<Task<()>> {
        info!("Adding USB filter '{}' to VM {}", filter.name, ctx.uuid());
        mutate(ctx, usb_filter_add_args(ctx.uuid(), index, filter), Check::Silent).await
    }

    pub async fn modify_usb_filter(ctx: &VmContext, index: u32, filter: &UsbFilter) -> VboxResult<Task<()>> {
        mutate(ctx, usb_filter_modify_args(ctx.uuid(), index, filter), Check::Silent).await
    }

    pub async fn remove_usb_filter(ctx: &VmContext, index: u32) -> VboxResult<Task<()>> {
        info!("Removing USB filter {} from VM {}", index, ctx.uuid());
        mutate(ctx, usb_filter_remove_args(ctx.uuid(), index), Check::Silent).await
    }

    pub async fn add_shared_folder(ctx: &VmContext, folder: &SharedFolder) -> VboxResult<Task<()>> {
        info!("Sharing {} as '{}' with VM {}", folder.host_path, folder.name, ctx.uuid());
        mutate(ctx, shared_folder_add_args(ctx.uuid(), folder), Check::Silent).await
    }

    pub async fn remove_shared_folder(ctx: &VmContext, name: &str) -> VboxResult<Task<()>> {
        info!("Removing shared folder '{}' from VM {}", name, ctx.uuid());
        mutate(ctx, shared_folder_remove_args(ctx.uuid(), name), Check::Silent).await
    }
}
