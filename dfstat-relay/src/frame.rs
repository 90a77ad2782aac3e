//! Wire format: `$destination#subject$` or `$destination#subject#body$`,
//! one frame per connection, the connection closed by the sender.

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub destination: String,
    pub subject: String,
    pub body: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FrameError {
    #[error("empty frame")]
    Empty,
    #[error("frame is not valid UTF-8")]
    NotUtf8,
    #[error("frame must start and end with '$'")]
    MissingDelimiter,
    #[error("expected 2 or 3 '#'-separated segments, found {0}")]
    Segments(usize),
    #[error("frame has an empty destination")]
    EmptyDestination,
}

/// Decode one frame. Surrounding whitespace (a trailing newline from `nc`) is ignored.
pub fn parse_frame(bytes: &[u8]) -> Result<Frame, FrameError> {
    let text = std::str::from_utf8(bytes).map_err(|_| FrameError::NotUtf8)?.trim();
    if text.is_empty() {
        return Err(FrameError::Empty);
    }

    let inner = text
        .strip_prefix('$')
        .and_then(|s| s.strip_suffix('$'))
        .ok_or(FrameError::MissingDelimiter)?;

    let segments: Vec<&str> = inner.split('#').collect();
    let (destination, subject, body) = match segments.as_slice() {
        [destination, subject] => (*destination, *subject, None),
        [destination, subject, body] => (*destination, *subject, Some(body.to_string())),
        other => return Err(FrameError::Segments(other.len())),
    };

    let destination = destination.trim();
    if destination.is_empty() {
        return Err(FrameError::EmptyDestination);
    }

    Ok(Frame {
        destination: destination.to_string(),
        subject: subject.trim().to_string(),
        body: body.filter(|b| !b.is_empty()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_subject_only_frame() {
        let frame = parse_frame(b"$ops@example.org#alpha is unreachable$").unwrap();
        assert_eq!(frame.destination, "ops@example.org");
        assert_eq!(frame.subject, "alpha is unreachable");
        assert_eq!(frame.body, None);
    }

    #[test]
    fn test_frame_with_body_and_trailing_newline() {
        let frame = parse_frame(b"$ops@example.org#Check /home on alpha#The diskspace is 80% occupied.$\n").unwrap();
        assert_eq!(frame.subject, "Check /home on alpha");
        assert_eq!(frame.body.as_deref(), Some("The diskspace is 80% occupied."));
    }

    #[test]
    fn test_malformed_frames() {
        assert_eq!(parse_frame(b""), Err(FrameError::Empty));
        assert_eq!(parse_frame(b"  \n"), Err(FrameError::Empty));
        assert_eq!(parse_frame(b"ops#subject$"), Err(FrameError::MissingDelimiter));
        assert_eq!(parse_frame(b"$ops#subject"), Err(FrameError::MissingDelimiter));
        assert_eq!(parse_frame(b"$"), Err(FrameError::MissingDelimiter));
        assert_eq!(parse_frame(b"$ops$"), Err(FrameError::Segments(1)));
        assert_eq!(parse_frame(b"$a#b#c#d$"), Err(FrameError::Segments(4)));
        assert_eq!(parse_frame(b"$ #subject$"), Err(FrameError::EmptyDestination));
        assert_eq!(parse_frame(&[b'$', 0xff, b'#', b'x', b'$']), Err(FrameError::NotUtf8));
    }
}
