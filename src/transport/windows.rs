//! Named pipe transport reachable across integrity levels
//!
//! The service usually runs elevated while the GUI runs at medium integrity.
//! A pipe created with the default descriptor would only admit the creating
//! principal at the creator's integrity level, so each instance gets:
//! - a DACL granting GENERIC_ALL to Everyone
//! - a SACL mandatory label of Low integrity with NO_WRITE_UP
//!
//! Without the label, clients fail with ERROR_ACCESS_DENIED.

use super::{BoxedStream, Listener};
use async_trait::async_trait;
use std::ffi::c_void;
use std::io;
use std::time::Duration;
use tokio::net::windows::named_pipe::{ClientOptions, NamedPipeServer, PipeMode, ServerOptions};
use tracing::{debug, info};
use windows::Win32::Foundation::{ERROR_PIPE_BUSY, HLOCAL, LocalFree};
use windows::Win32::Security::Authorization::{
    ConvertStringSecurityDescriptorToSecurityDescriptorW, SDDL_REVISION_1,
};
use windows::Win32::Security::{PSECURITY_DESCRIPTOR, SECURITY_ATTRIBUTES};
use windows::core::w;

const PIPE_BUFFER_SIZE: u32 = 1024 * 1024;
const BUSY_RETRIES: u32 = 20;

/// Owned self-relative security descriptor allocated by the SDDL converter.
struct SecurityDescriptor(PSECURITY_DESCRIPTOR);

// The descriptor is immutable after creation and only read by CreateNamedPipe.
unsafe impl Send for SecurityDescriptor {}

impl SecurityDescriptor {
    fn cross_privilege() -> io::Result<Self> {
        let mut descriptor = PSECURITY_DESCRIPTOR::default();
        unsafe {
            ConvertStringSecurityDescriptorToSecurityDescriptorW(
                w!("D:(A;;GA;;;WD)S:(ML;;NW;;;LW)"),
                SDDL_REVISION_1,
                &mut descriptor,
                None,
            )
        }
        .map_err(io::Error::other)?;
        Ok(Self(descriptor))
    }
}

impl Drop for SecurityDescriptor {
    fn drop(&mut self) {
        unsafe {
            let _ = LocalFree(HLOCAL(self.0.0));
        }
    }
}

pub struct PipeListener {
    address: String,
    descriptor: SecurityDescriptor,
    server: NamedPipeServer,
}

impl PipeListener {
    pub fn bind(address: &str) -> io::Result<Self> {
        let descriptor = SecurityDescriptor::cross_privilege()?;
        let server = create_instance(address, &descriptor)?;
        info!("Created named pipe with cross-privilege access: {}", address);
        Ok(Self {
            address: address.to_string(),
            descriptor,
            server,
        })
    }
}

// Not restricted to the first instance: an orphaned handle from a crashed
// service must not keep the new one from starting.
fn create_instance(address: &str, descriptor: &SecurityDescriptor) -> io::Result<NamedPipeServer> {
    let mut attributes = SECURITY_ATTRIBUTES {
        nLength: std::mem::size_of::<SECURITY_ATTRIBUTES>() as u32,
        lpSecurityDescriptor: descriptor.0.0,
        bInheritHandle: false.into(),
    };
    unsafe {
        ServerOptions::new()
            .pipe_mode(PipeMode::Byte)
            .in_buffer_size(PIPE_BUFFER_SIZE)
            .out_buffer_size(PIPE_BUFFER_SIZE)
            .create_with_security_attributes_raw(
                address,
                &mut attributes as *mut SECURITY_ATTRIBUTES as *mut c_void,
            )
    }
}

#[async_trait]
impl Listener for PipeListener {
    async fn accept(&mut self) -> io::Result<BoxedStream> {
        self.server.connect().await?;
        debug!("Client connected to pipe: {}", self.address);

        // Stand up the next instance before handing this one out
        let next = create_instance(&self.address, &self.descriptor)?;
        let connected = std::mem::replace(&mut self.server, next);
        Ok(Box::new(connected))
    }

    fn address(&self) -> &str {
        &self.address
    }
}

pub async fn connect(address: &str) -> io::Result<BoxedStream> {
    let mut attempts = 0;
    loop {
        match ClientOptions::new().open(address) {
            Ok(client) => return Ok(Box::new(client)),
            Err(e) if e.raw_os_error() == Some(ERROR_PIPE_BUSY.0 as i32) && attempts < BUSY_RETRIES => {
                attempts += 1;
            }
            Err(e) => return Err(e),
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}
