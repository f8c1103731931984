//! Worker side of the process boundary
//!
//! The supervisor re-executes its own binary with `worker --connect ADDR`.
//! The worker dials back, answers the handshake and then serves requests,
//! loading the plugin with a [`HostLoader`]. Everything the plugin touches
//! lives in this process, so killing it releases all of it.

use std::io::{BufReader, BufWriter, Read, Write};
use std::net::TcpStream;
use std::path::Path;

use hostwatch_kernel::protocol::{read_frame, write_frame};
use hostwatch_kernel::{PROTOCOL_VERSION, ProtocolError, Request, Response};
use tracing::{debug, info};

use crate::loader::HostLoader;

/// Connect to the supervisor at `addr` and serve until told to shut down
/// or the connection closes.
pub fn run(addr: &str) -> Result<(), ProtocolError> {
    // Die together with the supervisor even if it is killed outright.
    #[cfg(target_os = "linux")]
    if let Err(e) = nix::sys::prctl::set_pdeathsig(nix::sys::signal::Signal::SIGKILL) {
        debug!("Could not set parent death signal: {}", e);
    }

    let stream = TcpStream::connect(addr)?;
    stream.set_nodelay(true)?;
    let reader = BufReader::new(stream.try_clone()?);
    let writer = BufWriter::new(stream);

    serve(reader, writer)
}

/// Request loop over an established connection.
pub fn serve<R: Read, W: Write>(mut reader: R, mut writer: W) -> Result<(), ProtocolError> {
    let mut loader = HostLoader::new();

    loop {
        let request: Request = match read_frame(&mut reader) {
            Ok(request) => request,
            Err(e) if e.is_eof() => {
                debug!("Supervisor closed the connection");
                loader.stop();
                return Ok(());
            }
            Err(e) => {
                loader.stop();
                return Err(e);
            }
        };

        match request {
            Request::Hello { version } => {
                if version != PROTOCOL_VERSION {
                    write_frame(
                        &mut writer,
                        &Response::Err {
                            message: format!(
                                "protocol version mismatch: supervisor={version}, worker={PROTOCOL_VERSION}"
                            ),
                        },
                    )?;
                    return Err(ProtocolError::VersionMismatch {
                        expected: version,
                        actual: PROTOCOL_VERSION,
                    });
                }
                write_frame(
                    &mut writer,
                    &Response::HelloOk {
                        version: PROTOCOL_VERSION,
                        pid: std::process::id(),
                    },
                )?;
            }
            Request::Start {
                plugin_path,
                type_name,
                port,
            } => {
                info!("Starting server host from {}", plugin_path);
                let error = loader
                    .start(Path::new(&plugin_path), type_name.as_deref(), port)
                    .err()
                    .map(|e| e.describe());
                write_frame(&mut writer, &Response::Started { error })?;
            }
            Request::Stop => {
                loader.stop();
                write_frame(&mut writer, &Response::Stopped)?;
            }
            Request::Shutdown => {
                loader.stop();
                write_frame(&mut writer, &Response::Stopped)?;
                return Ok(());
            }
        }
    }
}
