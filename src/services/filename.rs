//! Identity extraction for scanned answer-sheet filenames.
//!
//! Accepted shape: `{12-digit register number}_{2-10 alphanumeric subject code}.{ext}` with
//! `ext` one of `pdf`, `jpg`, `jpeg`, `png` in any letter case.

use std::fmt;

use thiserror::Error;

pub(crate) const SUPPORTED_EXTENSIONS: [&str; 4] = ["pdf", "jpg", "jpeg", "png"];

const REGISTER_NUMBER_LEN: usize = 12;
const SUBJECT_CODE_MIN: usize = 2;
const SUBJECT_CODE_MAX: usize = 10;
const MAX_FILENAME_LEN: usize = 255;

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ArtifactIdentity {
    pub(crate) register_number: String,
    pub(crate) subject_code: String,
    pub(crate) extension: String,
}

impl ArtifactIdentity {
    pub(crate) fn mime_type(&self) -> &'static str {
        mime_type(&self.extension)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum InvalidReason {
    Empty,
    TooLong,
    MissingExtension,
    UnsupportedExtension,
    Shape,
    RegisterNumber,
    SubjectCode,
}

impl fmt::Display for InvalidReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let message = match self {
            Self::Empty => "filename is empty",
            Self::TooLong => "filename is longer than 255 characters",
            Self::MissingExtension => "filename has no extension",
            Self::UnsupportedExtension => "file extension must be one of pdf, jpg, jpeg, png",
            Self::Shape => "filename must look like REGISTERNUMBER_SUBJECTCODE.ext",
            Self::RegisterNumber => "register number must be exactly 12 digits",
            Self::SubjectCode => "subject code must be 2-10 letters or digits",
        };
        f.write_str(message)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid filename {filename:?}: {reason}")]
pub(crate) struct InvalidFilename {
    pub(crate) filename: String,
    pub(crate) reason: InvalidReason,
}

pub(crate) fn parse(filename: &str) -> Result<ArtifactIdentity, InvalidFilename> {
    let invalid = |reason| InvalidFilename { filename: filename.to_string(), reason };

    let trimmed = filename.trim();
    if trimmed.is_empty() {
        return Err(invalid(InvalidReason::Empty));
    }
    if trimmed.chars().count() > MAX_FILENAME_LEN {
        return Err(invalid(InvalidReason::TooLong));
    }

    let (stem, extension) =
        trimmed.rsplit_once('.').ok_or_else(|| invalid(InvalidReason::MissingExtension))?;
    let extension = extension.trim().to_ascii_lowercase();
    if extension.is_empty() {
        return Err(invalid(InvalidReason::MissingExtension));
    }
    if !SUPPORTED_EXTENSIONS.contains(&extension.as_str()) {
        return Err(invalid(InvalidReason::UnsupportedExtension));
    }

    let (register_number, subject_code) =
        stem.trim().split_once('_').ok_or_else(|| invalid(InvalidReason::Shape))?;

    if register_number.len() != REGISTER_NUMBER_LEN
        || !register_number.chars().all(|c| c.is_ascii_digit())
    {
        return Err(invalid(InvalidReason::RegisterNumber));
    }

    let subject_code = subject_code.trim();
    if subject_code.contains('_') {
        return Err(invalid(InvalidReason::Shape));
    }
    if !is_subject_code(subject_code) {
        return Err(invalid(InvalidReason::SubjectCode));
    }

    Ok(ArtifactIdentity {
        register_number: register_number.to_string(),
        subject_code: subject_code.to_ascii_uppercase(),
        extension,
    })
}

pub(crate) fn is_subject_code(value: &str) -> bool {
    (SUBJECT_CODE_MIN..=SUBJECT_CODE_MAX).contains(&value.len())
        && value.chars().all(|c| c.is_ascii_alphanumeric())
}

pub(crate) fn mime_type(extension: &str) -> &'static str {
    match extension {
        "pdf" => "application/pdf",
        "jpg" | "jpeg" => "image/jpeg",
        "png" => "image/png",
        _ => "application/octet-stream",
    }
}

/// Storage-safe rendition of an uploaded name: no path components, only `[A-Za-z0-9._-]`.
pub(crate) fn sanitize(filename: &str) -> String {
    let base = filename.rsplit(['/', '\\']).next().unwrap_or_default();

    let cleaned: String = base
        .chars()
        .filter(|c| *c != '\0')
        .map(|c| if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') { c } else { '_' })
        .collect();

    let cleaned = cleaned.trim_matches('.').replace("..", "_");
    if cleaned.is_empty() {
        "upload".to_string()
    } else {
        cleaned.chars().take(MAX_FILENAME_LEN).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_canonical_filename() {
        let identity = parse("611221104088_19AI405.pdf").expect("valid filename");
        assert_eq!(
            identity,
            ArtifactIdentity {
                register_number: "611221104088".to_string(),
                subject_code: "19AI405".to_string(),
                extension: "pdf".to_string(),
            }
        );
        assert_eq!(identity.mime_type(), "application/pdf");
    }

    #[test]
    fn parse_is_case_insensitive_on_extension_and_normalises_subject() {
        let identity = parse("611221104088_19ai405.JPEG").expect("valid filename");
        assert_eq!(identity.subject_code, "19AI405");
        assert_eq!(identity.extension, "jpeg");
        assert_eq!(identity.mime_type(), "image/jpeg");
    }

    #[test]
    fn parse_tolerates_whitespace_before_extension() {
        let identity = parse("123456789012_19AI405 .pdf").expect("valid filename");
        assert_eq!(identity.subject_code, "19AI405");
    }

    #[test]
    fn rejects_unsupported_extension() {
        let err = parse("611221104088_19AI405.exe").unwrap_err();
        assert_eq!(err.reason, InvalidReason::UnsupportedExtension);
    }

    #[test]
    fn rejects_eleven_digit_register_number() {
        let err = parse("61122110408_19AI405.pdf").unwrap_err();
        assert_eq!(err.reason, InvalidReason::RegisterNumber);
    }

    #[test]
    fn rejects_malformed_shapes() {
        assert_eq!(parse("").unwrap_err().reason, InvalidReason::Empty);
        assert_eq!(parse("611221104088_19AI405").unwrap_err().reason, InvalidReason::MissingExtension);
        assert_eq!(parse("61122110408819AI405.pdf").unwrap_err().reason, InvalidReason::Shape);
        assert_eq!(parse("611221104088_X.pdf").unwrap_err().reason, InvalidReason::SubjectCode);
        assert_eq!(
            parse("611221104088_ABCDEFGHIJK.pdf").unwrap_err().reason,
            InvalidReason::SubjectCode
        );
        assert_eq!(parse("611221104088_19AI-405.pdf").unwrap_err().reason, InvalidReason::SubjectCode);
        assert_eq!(parse("611221104088_19AI405_v2.pdf").unwrap_err().reason, InvalidReason::Shape);
        assert_eq!(parse(&format!("{}.pdf", "1".repeat(300))).unwrap_err().reason, InvalidReason::TooLong);
    }

    #[test]
    fn parse_is_deterministic() {
        assert_eq!(parse("611221104088_19AI405.png"), parse("611221104088_19AI405.png"));
        assert_eq!(parse("bad.exe"), parse("bad.exe"));
    }

    #[test]
    fn sanitize_strips_paths_and_specials() {
        assert_eq!(sanitize("../../etc/passwd"), "passwd");
        assert_eq!(sanitize("C:\\scans\\611221104088_19AI405.pdf"), "611221104088_19AI405.pdf");
        assert_eq!(sanitize("my file (1).pdf"), "my_file__1_.pdf");
        assert_eq!(sanitize("a..b.pdf"), "a_b.pdf");
        assert_eq!(sanitize("..."), "upload");
        assert_eq!(sanitize(""), "upload");
    }
}
