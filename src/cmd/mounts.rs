use crate::cmd::MountsArgs;
use crate::error::NfsVolError;
use crate::fs::OsFileSystem;
use crate::mountchecker::platform_checker;
use std::io::Write;
use std::sync::Arc;

/// Prints every live mount path matching the pattern, one per line.
pub fn mounts(args: MountsArgs) -> Result<(), NfsVolError> {
    let checker = platform_checker(Arc::new(OsFileSystem));
    let found = checker.list(&args.pattern)?;

    let mut out = std::io::stdout().lock();
    for path in found {
        writeln!(out, "{}", path.display())?;
    }
    Ok(())
}
