use std::fmt::Debug;
use std::io;
use std::path::Path;

pub(crate) fn create_file(
    path: &Path,
    allow_existing: bool,
) -> io::Result<std::fs::File> {
    let mut options = std::fs::OpenOptions::new();
    options.write(true);
    options.read(true);

    if allow_existing {
        options.create(true);
    } else {
        options.create_new(true);
    }

    let file = options.open(path)?;

    #[cfg(unix)]
    if let Some(parent) = path.parent() {
        std::fs::OpenOptions::new()
            .read(true)
            .open(parent)?
            .sync_all()?;
    }

    Ok(file)
}

#[track_caller]
/// Stop the system after an unrecoverable error.
///
/// Disk data cannot be trusted once a log write has failed or an internal
/// invariant has been broken, so the failure unit is the whole process and
/// not the operation which observed it.
///
/// Under `cfg(test)` this panics instead so the behaviour can be asserted.
pub(crate) fn abort_system(reason: &str, error: Option<&dyn Debug>) -> ! {
    let location = std::panic::Location::caller();
    tracing::error!(
        reason = reason,
        error = ?error,
        location = %location,
        "unrecoverable error, aborting system",
    );

    #[cfg(test)]
    panic!("system abort: {reason} error={error:?}");

    #[cfg(not(test))]
    std::process::abort()
}

#[cfg(feature = "failpoints")]
pub(crate) fn parse_io_error_return<T>(value: Option<String>) -> Result<T, io::Error> {
    let Some(value) = value else {
        return Err(io::Error::other("standard fail point error"));
    };
    let error_code = value
        .parse::<i32>()
        .expect("invalid io error code provided");
    Err(io::Error::from_raw_os_error(-error_code))
}

#[cfg(all(test, not(feature = "test-miri")))]
mod tests {
    use std::io::ErrorKind;

    use super::*;

    #[test]
    fn test_create_file_helper() {
        let dir = tempfile::tempdir().unwrap();

        let fp = dir.path().join("test1");
        create_file(&fp, true).expect("create file that doesn't exist should work");

        let error = create_file(&fp, false)
            .expect_err("allow existing should prevent file being created");
        assert_eq!(error.kind(), ErrorKind::AlreadyExists);

        create_file(&fp, true).expect("file should be over written");
    }

    #[test]
    #[should_panic(expected = "system abort: test abort")]
    fn test_abort_system_panics_in_tests() {
        let err = io::Error::other("boom");
        abort_system("test abort", Some(&err));
    }

    #[cfg(feature = "failpoints")]
    #[test]
    fn test_parse_io_error_return() {
        let err = parse_io_error_return::<()>(Some("-5".to_string())).unwrap_err();
        assert_eq!(err.raw_os_error(), Some(5));

        let err = parse_io_error_return::<()>(None).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Other);
    }
}
