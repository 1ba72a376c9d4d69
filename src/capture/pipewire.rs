//! Screen capture via the XDG ScreenCast portal + PipeWire
//!
//! The portal hands out a PipeWire node; a dedicated "pipewire-capture"
//! thread runs the PipeWire main loop and keeps the most recent frame.
//! [`CaptureSource::capture`] returns a copy of that frame.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use ashpd::desktop::screencast::{CursorMode, Screencast, SourceType};
use ashpd::desktop::PersistMode;
use parking_lot::Mutex;
use tracing::{debug, error, info};

use super::{CaptureError, CaptureSource, PixelFormat, ScreenImage};

type Latest = Arc<Mutex<Option<ScreenImage>>>;

/// Monitor captured through a screencast session
pub struct PipeWireSource {
    size: (u32, u32),
    latest: Latest,
    running: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl PipeWireSource {
    /// Ask the portal for a monitor and start streaming it
    ///
    /// `size` is the resolution requested from PipeWire; the compositor may
    /// still pick another one, in which case frames are skipped by the
    /// color processor.
    pub async fn open(size: (u32, u32), fps: u32) -> Result<Self, CaptureError> {
        let portal = |e: ashpd::Error| CaptureError::Portal(e.to_string());

        let screencast = Screencast::new().await.map_err(portal)?;
        let session = screencast.create_session().await.map_err(portal)?;
        screencast
            .select_sources(
                &session,
                CursorMode::Hidden,
                SourceType::Monitor.into(),
                false,
                None,
                PersistMode::DoNot,
            )
            .await
            .map_err(portal)?;
        let response = screencast
            .start(&session, None)
            .await
            .map_err(portal)?
            .response()
            .map_err(portal)?;

        let node_id = response
            .streams()
            .first()
            .map(|s| s.pipe_wire_node_id())
            .ok_or_else(|| CaptureError::Portal("no stream returned".into()))?;
        info!("Screencast started on PipeWire node {node_id}");

        let latest: Latest = Arc::new(Mutex::new(None));
        let running = Arc::new(AtomicBool::new(true));
        let thread = {
            let latest = Arc::clone(&latest);
            let running = Arc::clone(&running);
            thread::Builder::new()
                .name("pipewire-capture".into())
                .spawn(move || {
                    if let Err(e) = run_stream(node_id, size, fps, latest, running) {
                        error!("PipeWire capture stopped: {e}");
                    }
                })?
        };

        Ok(Self {
            size,
            latest,
            running,
            thread: Some(thread),
        })
    }

    /// Blocking variant of [`PipeWireSource::open`] for callers without a
    /// runtime
    pub fn open_blocking(size: (u32, u32), fps: u32) -> Result<Self, CaptureError> {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;
        rt.block_on(Self::open(size, fps))
    }
}

impl CaptureSource for PipeWireSource {
    fn name(&self) -> &str {
        "pipewire"
    }

    fn size(&self) -> (u32, u32) {
        self.size
    }

    fn capture(&self) -> Result<ScreenImage, CaptureError> {
        if !self.running.load(Ordering::Acquire) {
            return Err(CaptureError::Unavailable("PipeWire stream ended".into()));
        }
        self.latest.lock().clone().ok_or(CaptureError::NoFrame)
    }
}

impl Drop for PipeWireSource {
    fn drop(&mut self) {
        self.running.store(false, Ordering::Release);
        if let Some(handle) = self.thread.take() {
            let _ = handle.join();
        }
    }
}

/// Negotiated stream format
#[derive(Debug, Clone, Copy, Default)]
struct Negotiated {
    width: u32,
    height: u32,
    format: Option<PixelFormat>,
}

/// Run the PipeWire loop until `running` is cleared (blocking)
fn run_stream(
    node_id: u32,
    size: (u32, u32),
    fps: u32,
    latest: Latest,
    running: Arc<AtomicBool>,
) -> Result<(), CaptureError> {
    use pipewire as pw;
    use pw::context::Context;
    use pw::main_loop::MainLoop;
    use pw::spa::param::video::VideoFormat;
    use pw::spa::utils::Direction;
    use pw::stream::{Stream, StreamFlags};
    use std::cell::Cell;
    use std::rc::Rc;

    let pw_err = |e: pw::Error| CaptureError::PipeWire(e.to_string());

    pw::init();
    let main_loop = MainLoop::new(None).map_err(pw_err)?;
    let context = Context::new(&main_loop).map_err(pw_err)?;
    let core = context.connect(None).map_err(pw_err)?;

    let props = pw::properties::properties! {
        *pw::keys::MEDIA_TYPE => "Video",
        *pw::keys::MEDIA_CATEGORY => "Capture",
        *pw::keys::MEDIA_ROLE => "Screen",
    };
    let stream = Stream::new(&core, "ambilume-capture", props).map_err(pw_err)?;

    let negotiated = Rc::new(Cell::new(Negotiated::default()));
    let on_format = Rc::clone(&negotiated);
    let running_cb = Arc::clone(&running);

    let _listener = stream
        .add_local_listener_with_user_data(())
        .state_changed(|_, _, old, new| {
            debug!("PipeWire stream {old:?} -> {new:?}");
        })
        .param_changed(move |_, _, id, pod| {
            use pw::spa::param::ParamType;
            if id != ParamType::Format.as_raw() {
                return;
            }
            if let Some(n) = pod.and_then(parse_format) {
                info!("PipeWire negotiated {}x{} {:?}", n.width, n.height, n.format);
                on_format.set(n);
            }
        })
        .process(move |stream, _| {
            let Some(mut buffer) = stream.dequeue_buffer() else {
                return;
            };
            let n = negotiated.get();
            let Some(format) = n.format else {
                return;
            };
            if n.width == 0 || n.height == 0 || !running_cb.load(Ordering::Acquire) {
                return;
            }
            let datas = buffer.datas_mut();
            let Some(data) = datas.first_mut() else {
                return;
            };
            let row = n.width as usize * 4;
            let stride = usize::try_from(data.chunk().stride())
                .ok()
                .filter(|s| *s >= row)
                .unwrap_or(row);
            if let Some(bytes) = data.data() {
                if let Some(packed) = pack_rows(bytes, row, stride, n.height as usize) {
                    *latest.lock() = Some(ScreenImage::new(n.width, n.height, format, packed));
                }
            }
        })
        .register()
        .map_err(pw_err)?;

    let obj = pw::spa::pod::object!(
        pw::spa::utils::SpaTypes::ObjectParamFormat,
        pw::spa::param::ParamType::EnumFormat,
        pw::spa::pod::property!(
            pw::spa::param::format::FormatProperties::MediaType,
            Id,
            pw::spa::param::format::MediaType::Video
        ),
        pw::spa::pod::property!(
            pw::spa::param::format::FormatProperties::MediaSubtype,
            Id,
            pw::spa::param::format::MediaSubtype::Raw
        ),
        pw::spa::pod::property!(
            pw::spa::param::format::FormatProperties::VideoFormat,
            Choice,
            Enum,
            Id,
            VideoFormat::BGRx,
            VideoFormat::BGRx,
            VideoFormat::RGBx,
            VideoFormat::RGBA,
            VideoFormat::BGRA
        ),
        pw::spa::pod::property!(
            pw::spa::param::format::FormatProperties::VideoSize,
            Choice,
            Range,
            Rectangle,
            pw::spa::utils::Rectangle {
                width: size.0,
                height: size.1
            },
            pw::spa::utils::Rectangle {
                width: 1,
                height: 1
            },
            pw::spa::utils::Rectangle {
                width: 8192,
                height: 8192
            }
        ),
        pw::spa::pod::property!(
            pw::spa::param::format::FormatProperties::VideoFramerate,
            Choice,
            Range,
            Fraction,
            pw::spa::utils::Fraction { num: fps, denom: 1 },
            pw::spa::utils::Fraction { num: 0, denom: 1 },
            pw::spa::utils::Fraction { num: 144, denom: 1 }
        )
    );

    let values = pw::spa::pod::serialize::PodSerializer::serialize(
        std::io::Cursor::new(Vec::new()),
        &pw::spa::pod::Value::Object(obj),
    )
    .map_err(|e| CaptureError::PipeWire(format!("serialize format: {e:?}")))?
    .0
    .into_inner();
    let pod = pw::spa::pod::Pod::from_bytes(&values)
        .ok_or_else(|| CaptureError::PipeWire("invalid format pod".into()))?;

    stream
        .connect(
            Direction::Input,
            Some(node_id),
            StreamFlags::AUTOCONNECT | StreamFlags::MAP_BUFFERS,
            &mut [pod],
        )
        .map_err(pw_err)?;

    let loop_ = main_loop.loop_();
    while running.load(Ordering::Acquire) {
        let n_events = loop_.iterate(Duration::from_millis(50));
        if n_events < 0 {
            running.store(false, Ordering::Release);
            return Err(CaptureError::PipeWire(format!(
                "loop iterate returned {n_events}"
            )));
        }
    }
    Ok(())
}

fn parse_format(pod: &pipewire::spa::pod::Pod) -> Option<Negotiated> {
    use pipewire::spa::param::video::{VideoFormat, VideoInfoRaw};

    let mut info = VideoInfoRaw::new();
    info.parse(pod).ok()?;
    let size = info.size();
    let format = match info.format() {
        VideoFormat::RGBx | VideoFormat::RGBA => PixelFormat::Rgba,
        _ => PixelFormat::Bgra,
    };
    Some(Negotiated {
        width: size.width,
        height: size.height,
        format: Some(format),
    })
}

/// Drop per-row padding: `height` rows of `row` bytes spaced `stride` apart.
fn pack_rows(bytes: &[u8], row: usize, stride: usize, height: usize) -> Option<Vec<u8>> {
    if height == 0 || bytes.len() < stride * (height - 1) + row {
        return None;
    }
    if stride == row {
        return Some(bytes[..row * height].to_vec());
    }
    let mut out = Vec::with_capacity(row * height);
    for y in 0..height {
        out.extend_from_slice(&bytes[y * stride..y * stride + row]);
    }
    Some(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pack_rows_strips_padding() {
        // 2 rows of 4 bytes with 2 bytes of padding each
        let bytes = [1, 2, 3, 4, 0, 0, 5, 6, 7, 8, 0, 0];
        assert_eq!(
            pack_rows(&bytes, 4, 6, 2).unwrap(),
            vec![1, 2, 3, 4, 5, 6, 7, 8]
        );
        assert_eq!(pack_rows(&bytes[..4], 4, 4, 1).unwrap(), vec![1, 2, 3, 4]);
        assert!(pack_rows(&bytes[..8], 4, 6, 2).is_none());
    }
}
