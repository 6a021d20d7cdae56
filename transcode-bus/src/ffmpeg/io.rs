//! AVIOContexts over the stage byte capabilities, so FFmpeg reads from a
//! [`MediaInput`] and writes to a [`ByteSink`] instead of opening paths itself.

use std::{
    ffi::{CString, c_void},
    io::SeekFrom,
    ptr,
};

use ffmpeg_next::ffi;

use crate::stage::{ByteSink, MediaInput};

const BUFFER_SIZE: usize = 64 * 1024;
const AVSEEK_SIZE: i32 = 0x10000;

fn seek_from(offset: i64, whence: i32) -> Option<SeekFrom> {
    // AVSEEK_FORCE may be or'ed in.
    match whence & 0xffff {
        0 => Some(SeekFrom::Start(offset as u64)),
        1 => Some(SeekFrom::Current(offset)),
        2 => Some(SeekFrom::End(offset)),
        _ => None,
    }
}

unsafe extern "C" fn read_packet(opaque: *mut c_void, buf: *mut u8, buf_size: i32) -> i32 {
    let input = unsafe { &mut *(opaque as *mut Box<dyn MediaInput>) };
    let slice = unsafe { std::slice::from_raw_parts_mut(buf, buf_size as usize) };
    match input.read(slice) {
        Ok(0) => ffi::AVERROR_EOF,
        Ok(n) => n as i32,
        Err(e) => {
            log::error!("input read failed: {}", e);
            -1
        }
    }
}

unsafe extern "C" fn seek_input(opaque: *mut c_void, offset: i64, whence: i32) -> i64 {
    let input = unsafe { &mut *(opaque as *mut Box<dyn MediaInput>) };
    if whence & AVSEEK_SIZE != 0 {
        let size = input.stream_position().and_then(|current| {
            let end = input.seek(SeekFrom::End(0))?;
            input.seek(SeekFrom::Start(current))?;
            Ok(end)
        });
        return size.map(|s| s as i64).unwrap_or(-1);
    }
    match seek_from(offset, whence).map(|pos| input.seek(pos)) {
        Some(Ok(pos)) => pos as i64,
        _ => -1,
    }
}

unsafe extern "C" fn write_packet(opaque: *mut c_void, buf: *const u8, buf_size: i32) -> i32 {
    let sink = unsafe { &mut *(opaque as *mut Box<dyn ByteSink>) };
    let slice = unsafe { std::slice::from_raw_parts(buf, buf_size as usize) };
    match sink.write(slice) {
        Ok(()) => buf_size,
        Err(e) => {
            log::error!("output write failed: {:#}", e);
            -1
        }
    }
}

unsafe extern "C" fn seek_output(opaque: *mut c_void, offset: i64, whence: i32) -> i64 {
    let sink = unsafe { &mut *(opaque as *mut Box<dyn ByteSink>) };
    if whence & AVSEEK_SIZE != 0 {
        return -1;
    }
    match seek_from(offset, whence).map(|pos| sink.seek(pos)) {
        Some(Ok(pos)) => pos as i64,
        _ => -1,
    }
}

/// An AVIOContext plus the boxed Rust object its callbacks point at.
struct Avio<T: ?Sized> {
    context: *mut ffi::AVIOContext,
    opaque: *mut Box<T>,
}

impl<T: ?Sized> Avio<T> {
    fn new(
        target: Box<T>,
        writable: bool,
        read: Option<unsafe extern "C" fn(*mut c_void, *mut u8, i32) -> i32>,
        write: Option<unsafe extern "C" fn(*mut c_void, *const u8, i32) -> i32>,
        seek: Option<unsafe extern "C" fn(*mut c_void, i64, i32) -> i64>,
    ) -> anyhow::Result<Self> {
        let opaque = Box::into_raw(Box::new(target));
        unsafe {
            let buffer = ffi::av_malloc(BUFFER_SIZE) as *mut u8;
            if buffer.is_null() {
                drop(Box::from_raw(opaque));
                return Err(anyhow::anyhow!("failed to allocate AVIO buffer"));
            }
            let context = ffi::avio_alloc_context(
                buffer,
                BUFFER_SIZE as i32,
                writable as i32,
                opaque as *mut c_void,
                read,
                write,
                seek,
            );
            if context.is_null() {
                ffi::av_free(buffer as *mut c_void);
                drop(Box::from_raw(opaque));
                return Err(anyhow::anyhow!("failed to allocate AVIO context"));
            }
            Ok(Self { context, opaque })
        }
    }
}

impl<T: ?Sized> Drop for Avio<T> {
    fn drop(&mut self) {
        unsafe {
            // The buffer may have been reallocated by FFmpeg.
            ffi::av_freep(&mut (*self.context).buffer as *mut *mut u8 as *mut c_void);
            ffi::avio_context_free(&mut self.context);
            drop(Box::from_raw(self.opaque));
        }
    }
}

/// Demuxing context reading through a [`MediaInput`].
pub struct InputContext {
    // Declared first: closed before the AVIO context it reads from.
    pub input: ffmpeg_next::format::context::Input,
    _io: Avio<dyn MediaInput>,
}

unsafe impl Send for InputContext {}

impl Drop for InputContext {
    fn drop(&mut self) {
        unsafe { (*self.input.as_mut_ptr()).pb = ptr::null_mut() };
    }
}

impl InputContext {
    pub fn open(input: Box<dyn MediaInput>) -> anyhow::Result<Self> {
        let io = Avio::new(input, false, Some(read_packet), None, Some(seek_input))?;
        unsafe {
            let mut context = ffi::avformat_alloc_context();
            if context.is_null() {
                return Err(anyhow::anyhow!("failed to allocate input context"));
            }
            (*context).pb = io.context;
            (*context).flags |= ffi::AVFMT_FLAG_CUSTOM_IO;

            // On failure the context is freed by avformat_open_input.
            let ret = ffi::avformat_open_input(
                &mut context,
                ptr::null_mut(),
                ptr::null_mut(),
                ptr::null_mut(),
            );
            if ret < 0 {
                return Err(anyhow::anyhow!(
                    "could not recognize the input format: {}",
                    ffmpeg_next::Error::from(ret)
                ));
            }
            let input = ffmpeg_next::format::context::Input::wrap(context);
            let ret = ffi::avformat_find_stream_info(context, ptr::null_mut());
            if ret < 0 {
                return Err(anyhow::anyhow!(
                    "could not find stream information: {}",
                    ffmpeg_next::Error::from(ret)
                ));
            }
            Ok(Self { input, _io: io })
        }
    }
}

/// Muxing context writing through a [`ByteSink`].
pub struct OutputContext {
    pub output: ffmpeg_next::format::context::Output,
    io: Avio<dyn ByteSink>,
}

unsafe impl Send for OutputContext {}

impl Drop for OutputContext {
    // Keeps the output from closing our AVIO context as if FFmpeg owned it.
    fn drop(&mut self) {
        unsafe { (*self.output.as_mut_ptr()).pb = ptr::null_mut() };
    }
}

impl OutputContext {
    pub fn open(format: &str, sink: Box<dyn ByteSink>) -> anyhow::Result<Self> {
        let format_name = CString::new(format)
            .map_err(|e| anyhow::anyhow!("invalid format name {:?}: {}", format, e))?;
        let io = Avio::new(sink, true, None, Some(write_packet), Some(seek_output))?;
        unsafe {
            let mut context: *mut ffi::AVFormatContext = ptr::null_mut();
            let ret = ffi::avformat_alloc_output_context2(
                &mut context,
                ptr::null_mut(),
                format_name.as_ptr(),
                ptr::null_mut(),
            );
            if ret < 0 || context.is_null() {
                return Err(anyhow::anyhow!("muxer not found: {}", format));
            }
            (*context).pb = io.context;
            (*context).flags |= ffi::AVFMT_FLAG_CUSTOM_IO;
            Ok(Self {
                output: ffmpeg_next::format::context::Output::wrap(context),
                io,
            })
        }
    }

    /// Flushes buffered bytes into the sink and closes it.
    pub fn finish(&mut self) -> anyhow::Result<()> {
        unsafe {
            ffi::avio_flush(self.io.context);
            (**self.io.opaque).finish()
        }
    }
}

/// Whether FFmpeg can produce the named container.
pub fn has_muxer(format: &str) -> bool {
    let Ok(name) = CString::new(format) else {
        return false;
    };
    unsafe { !ffi::av_guess_format(name.as_ptr(), ptr::null_mut(), ptr::null_mut()).is_null() }
}
