//! 置換表バッキング配列の確保
//!
//! 可能なら huge pages を要求し、失敗時は通常ページへフォールバック
//! する。確保自体の失敗は `None` で返し、呼び出し側（`resize`）が
//! サイズを半分にして再試行できるようにする。

use std::ptr::NonNull;

#[cfg(not(windows))]
use std::alloc::{alloc_zeroed, dealloc, Layout};

#[cfg(windows)]
use windows_sys::Win32::Foundation::{CloseHandle, GetLastError, ERROR_SUCCESS};
#[cfg(windows)]
use windows_sys::Win32::Security::{
    AdjustTokenPrivileges, LookupPrivilegeValueA, OpenProcessToken, LUID, LUID_AND_ATTRIBUTES,
    SE_PRIVILEGE_ENABLED, TOKEN_ADJUST_PRIVILEGES, TOKEN_PRIVILEGES, TOKEN_QUERY,
};
#[cfg(windows)]
use windows_sys::Win32::System::Memory::{
    GetLargePageMinimum, VirtualAlloc, VirtualFree, MEM_COMMIT, MEM_LARGE_PAGES, MEM_RELEASE,
    MEM_RESERVE, PAGE_READWRITE,
};
#[cfg(windows)]
use windows_sys::Win32::System::Threading::GetCurrentProcess;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(super) enum AllocKind {
    LargePages,
    /// Large Pages が使えない環境・失敗時のフォールバック
    #[allow(dead_code)]
    Regular,
}

/// ゼロ初期化済みのページ確保
pub(super) struct Allocation {
    ptr: NonNull<u8>,
    kind: AllocKind,
    #[cfg(not(windows))]
    layout: Layout,
}

impl Allocation {
    /// 確保を試みる。失敗時は `None`
    pub(super) fn try_allocate(size: usize, alignment: usize) -> Option<Self> {
        #[cfg(windows)]
        {
            if let Some(allocation) = try_alloc_large_pages(size) {
                return Some(allocation);
            }
            try_alloc_windows(size)
        }

        #[cfg(not(windows))]
        {
            try_alloc_unix(size, alignment)
        }
    }

    pub(super) fn ptr(&self) -> NonNull<u8> {
        self.ptr
    }

    pub(super) fn kind(&self) -> AllocKind {
        self.kind
    }
}

#[cfg(windows)]
fn align_up(value: usize, align: usize) -> usize {
    debug_assert!(value.checked_add(align - 1).is_some());
    (value + align - 1) / align * align
}

#[cfg(windows)]
fn try_alloc_large_pages(size: usize) -> Option<Allocation> {
    unsafe {
        let large_page_size = GetLargePageMinimum() as usize;
        if large_page_size == 0 {
            return None;
        }

        // SeLockMemoryPrivilege を一時的に有効化する
        let mut token = 0;
        if OpenProcessToken(GetCurrentProcess(), TOKEN_ADJUST_PRIVILEGES | TOKEN_QUERY, &mut token)
            == 0
        {
            return None;
        }

        let mut luid = LUID {
            LowPart: 0,
            HighPart: 0,
        };
        if LookupPrivilegeValueA(
            std::ptr::null(),
            b"SeLockMemoryPrivilege\0".as_ptr() as *const i8,
            &mut luid,
        ) == 0
        {
            CloseHandle(token);
            return None;
        }

        let mut tp = TOKEN_PRIVILEGES {
            PrivilegeCount: 1,
            Privileges: [LUID_AND_ATTRIBUTES {
                Luid: luid,
                Attributes: SE_PRIVILEGE_ENABLED,
            }],
        };
        let mut prev_tp = TOKEN_PRIVILEGES {
            PrivilegeCount: 0,
            Privileges: [LUID_AND_ATTRIBUTES {
                Luid: LUID {
                    LowPart: 0,
                    HighPart: 0,
                },
                Attributes: 0,
            }],
        };
        let mut prev_len = std::mem::size_of::<TOKEN_PRIVILEGES>() as u32;

        if AdjustTokenPrivileges(token, 0, &mut tp, prev_len, &mut prev_tp, &mut prev_len) == 0
            || GetLastError() != ERROR_SUCCESS
        {
            CloseHandle(token);
            return None;
        }

        let alloc_size = align_up(size, large_page_size);
        let ptr = VirtualAlloc(
            std::ptr::null_mut(),
            alloc_size,
            MEM_RESERVE | MEM_COMMIT | MEM_LARGE_PAGES,
            PAGE_READWRITE,
        );

        AdjustTokenPrivileges(
            token,
            0,
            &mut prev_tp,
            0,
            std::ptr::null_mut(),
            std::ptr::null_mut(),
        );
        CloseHandle(token);

        let ptr = NonNull::new(ptr as *mut u8)?;
        Some(Allocation {
            ptr,
            kind: AllocKind::LargePages,
        })
    }
}

#[cfg(windows)]
fn try_alloc_windows(size: usize) -> Option<Allocation> {
    unsafe {
        let ptr =
            VirtualAlloc(std::ptr::null_mut(), size, MEM_RESERVE | MEM_COMMIT, PAGE_READWRITE);
        let ptr = NonNull::new(ptr as *mut u8)?;
        Some(Allocation {
            ptr,
            kind: AllocKind::Regular,
        })
    }
}

#[cfg(not(windows))]
fn try_alloc_unix(size: usize, alignment: usize) -> Option<Allocation> {
    #[cfg(any(target_os = "linux", target_os = "android"))]
    let (page_align, kind) = (2 * 1024 * 1024, AllocKind::LargePages);
    #[cfg(not(any(target_os = "linux", target_os = "android")))]
    let (page_align, kind) = (4096, AllocKind::Regular);

    let alignment = alignment.max(page_align);
    let layout = Layout::from_size_align(size, alignment).ok()?.pad_to_align();

    // SAFETY: layout はゼロサイズでない有効なレイアウト
    let ptr = unsafe { alloc_zeroed(layout) };
    let ptr = NonNull::new(ptr)?;

    #[cfg(any(target_os = "linux", target_os = "android"))]
    // SAFETY: 確保済み領域に対する madvise。失敗しても動作には影響しない
    unsafe {
        let result = libc::madvise(ptr.as_ptr() as *mut _, layout.size(), libc::MADV_HUGEPAGE);
        #[cfg(debug_assertions)]
        if result != 0 {
            log::debug!("madvise MADV_HUGEPAGE failed");
        }
        #[cfg(not(debug_assertions))]
        let _ = result;
    }

    Some(Allocation { ptr, kind, layout })
}

impl Drop for Allocation {
    fn drop(&mut self) {
        unsafe {
            #[cfg(windows)]
            {
                let ok = VirtualFree(self.ptr.as_ptr() as *mut _, 0, MEM_RELEASE);
                if ok == 0 {
                    log::error!("VirtualFree failed with error {}", GetLastError());
                    debug_assert!(false, "VirtualFree failed");
                }
            }
            #[cfg(not(windows))]
            {
                dealloc(self.ptr.as_ptr(), self.layout);
            }
        }
    }
}

// SAFETY: Allocation は生メモリを所有するだけで、アクセスの同期は
// 上位層（HashTable のアトミックエントリ）が担う
unsafe impl Send for Allocation {}
unsafe impl Sync for Allocation {}
