//! Sharing a single page with another process.

use crate::{AddressSpace, Kernel, KernelError, PageNumber, ProcessId};

/// Maps `page` of the calling process into `target` at the same address.
///
/// Writable and copy-on-write pages are installed copy-on-write in the target and then
/// re-installed copy-on-write in the caller. The second map happens even when the page was
/// already copy-on-write: every holder of a shared page must carry the marker, or a later fork
/// from that holder would hand out the frame as if it owned it exclusively. Other pages are
/// installed with the caller's permissions.
///
/// Calling this twice for the same page leaves the caller's mapping as it was after the first
/// call.
pub(crate) fn duplicate_page<K>(
    kernel: &K,
    me: ProcessId,
    target: ProcessId,
    page: PageNumber,
) -> Result<(), KernelError>
where
    K: Kernel + AddressSpace,
{
    let address = page.start();
    let sharing = kernel.permissions(page).sharing();

    kernel.map_page(me, address, target, address, sharing.target_permissions())?;
    if let Some(permissions) = sharing.source_permissions() {
        kernel.map_page(me, address, me, address, permissions)?;
    }

    log::trace!(
        "[{}] shared page {} with {} as {}",
        me,
        address,
        target,
        sharing.target_permissions()
    );
    Ok(())
}
