//! ELF segment classification for module protection.
//!
//! Writable `PT_LOAD` segments become private to the owning compartment, except
//! for RELRO and the shared-data section. Read-only segments stay shared: file
//! contents are not secret, and the loader must read ELF metadata from every
//! compartment.

use std::ffi::CStr;
use std::ops::Range;

use crate::compartment::{CompartmentId, ConfigError, ConfigResult};
use crate::error::HardwareResult;
use crate::hardware::{PAGE_SIZE, ProtectionHardware, page_ceil, page_floor};
use crate::memory::map::{Classification, Region};

const PT_LOAD: u32 = 1;
const PT_TLS: u32 = 7;
const PT_GNU_RELRO: u32 = 0x6474_e552;
const PF_X: u32 = 1;
const PF_W: u32 = 2;
const PF_R: u32 = 4;

/// Section name `shared_data!` statics are placed in.
pub const SHARED_SECTION: &str = "mpkgate_shared";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentKind {
    Load,
    Tls,
    Relro,
}

/// One program header, relocated to its runtime address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    pub kind: SegmentKind,
    pub start: usize,
    pub len: usize,
    pub align: usize,
    pub flags: u32,
}

impl Segment {
    pub fn writable(&self) -> bool {
        self.flags & PF_W != 0
    }

    fn prot(&self) -> i32 {
        let mut prot = libc::PROT_NONE;
        if self.flags & PF_R != 0 {
            prot |= libc::PROT_READ;
        }
        if self.flags & PF_W != 0 {
            prot |= libc::PROT_WRITE;
        }
        if self.flags & PF_X != 0 {
            prot |= libc::PROT_EXEC;
        }
        prot
    }

    fn pages(&self) -> Range<usize> {
        page_floor(self.start)..page_ceil(self.start + self.len)
    }
}

/// A loaded object and its segments.
#[derive(Debug, Clone)]
pub struct ModuleImage {
    /// Path as reported by the loader; empty for the main executable.
    pub name: String,
    pub base: usize,
    pub segments: Vec<Segment>,
}

/// `range` minus `holes`.
fn subtract(range: Range<usize>, holes: &[Range<usize>]) -> Vec<Range<usize>> {
    let mut holes: Vec<&Range<usize>> = holes
        .iter()
        .filter(|h| h.start < range.end && h.end > range.start)
        .collect();
    holes.sort_by_key(|h| h.start);
    let mut pieces = Vec::new();
    let mut cursor = range.start;
    for hole in holes {
        if hole.start > cursor {
            pieces.push(cursor..hole.start);
        }
        cursor = cursor.max(hole.end);
    }
    if cursor < range.end {
        pieces.push(cursor..range.end);
    }
    pieces
}

fn intersect(a: &Range<usize>, b: &Range<usize>) -> Option<Range<usize>> {
    let r = a.start.max(b.start)..a.end.min(b.end);
    (r.start < r.end).then_some(r)
}

/// Work out how `image` is split into private and shared regions.
///
/// `shared` holds the bounds of shared-data sections. Each must start on a
/// page boundary; its end is rounded up.
pub fn plan(
    image: &ModuleImage,
    owner: CompartmentId,
    shared: &[Range<usize>],
) -> ConfigResult<Vec<Region>> {
    let label = if image.name.is_empty() {
        "<main>"
    } else {
        image.name.rsplit('/').next().unwrap_or(&image.name)
    };

    let mut shared_pages = Vec::new();
    for range in shared.iter().filter(|r| r.start < r.end) {
        if range.start % PAGE_SIZE != 0 {
            return Err(ConfigError::UnalignedSharedSection {
                start: range.start,
                end: range.end,
            });
        }
        shared_pages.push(range.start..page_ceil(range.end));
    }
    let relro: Vec<Range<usize>> = image
        .segments
        .iter()
        .filter(|s| s.kind == SegmentKind::Relro)
        .map(Segment::pages)
        .collect();

    let mut regions = Vec::new();
    for seg in &image.segments {
        match seg.kind {
            SegmentKind::Tls if seg.len > 0 && seg.align < PAGE_SIZE => {
                return Err(ConfigError::TlsNotPadded {
                    module: label.to_string(),
                });
            }
            SegmentKind::Load if seg.len > 0 => {}
            _ => continue,
        }
        let pages = seg.pages();
        if !seg.writable() {
            regions.push(Region::new(
                pages.start,
                pages.len(),
                owner,
                Classification::SharedRo,
                seg.prot(),
                format!("{label} ro"),
            ));
            continue;
        }

        let holes: Vec<Range<usize>> = relro.iter().chain(&shared_pages).cloned().collect();
        for piece in subtract(pages.clone(), &holes) {
            regions.push(Region::new(
                piece.start,
                piece.len(),
                owner,
                Classification::Private,
                seg.prot(),
                format!("{label} data"),
            ));
        }
        for hole in &relro {
            if let Some(r) = intersect(&pages, hole) {
                regions.push(Region::new(
                    r.start,
                    r.len(),
                    owner,
                    Classification::SharedRo,
                    libc::PROT_READ,
                    format!("{label} relro"),
                ));
            }
        }
        for hole in &shared_pages {
            if let Some(r) = intersect(&pages, hole) {
                regions.push(Region::new(
                    r.start,
                    r.len(),
                    owner,
                    Classification::SharedRw,
                    libc::PROT_READ | libc::PROT_WRITE,
                    format!("{label} shared"),
                ));
            }
        }
    }
    regions.sort_by_key(|r| r.start);
    Ok(regions)
}

/// Tag the private regions of a plan.
pub fn apply(regions: &[Region], hardware: &dyn ProtectionHardware) -> HardwareResult<()> {
    for region in regions.iter().filter(|r| r.class == Classification::Private) {
        // Safety: planned regions are page-aligned ranges of a loaded module.
        unsafe {
            hardware.tag_pages(region.start as *mut u8, region.len, region.prot, region.key())?;
        }
        tracing::debug!(%region, "tagged module pages");
    }
    Ok(())
}

unsafe extern "C" fn collect_module(
    info: *mut libc::dl_phdr_info,
    _size: libc::size_t,
    data: *mut libc::c_void,
) -> libc::c_int {
    // Safety: `data` is the vector passed to `dl_iterate_phdr` below and `info`
    // is valid for the duration of the callback.
    let (modules, info) = unsafe { (&mut *data.cast::<Vec<ModuleImage>>(), &*info) };
    let name = if info.dlpi_name.is_null() {
        String::new()
    } else {
        unsafe { CStr::from_ptr(info.dlpi_name) }
            .to_string_lossy()
            .into_owned()
    };
    let base = info.dlpi_addr as usize;
    let mut segments = Vec::new();
    for i in 0..info.dlpi_phnum as usize {
        let ph = unsafe { &*info.dlpi_phdr.add(i) };
        let kind = match ph.p_type {
            PT_LOAD => SegmentKind::Load,
            PT_TLS => SegmentKind::Tls,
            PT_GNU_RELRO => SegmentKind::Relro,
            _ => continue,
        };
        segments.push(Segment {
            kind,
            start: base + ph.p_vaddr as usize,
            len: ph.p_memsz as usize,
            align: ph.p_align as usize,
            flags: ph.p_flags,
        });
    }
    modules.push(ModuleImage {
        name,
        base,
        segments,
    });
    0
}

/// Every object currently mapped by the dynamic loader.
pub fn loaded_modules() -> Vec<ModuleImage> {
    let mut modules: Vec<ModuleImage> = Vec::new();
    // Safety: the callback only touches `modules` and the loader's info.
    unsafe {
        libc::dl_iterate_phdr(
            Some(collect_module),
            (&mut modules as *mut Vec<ModuleImage>).cast(),
        );
    }
    modules
}

/// Bounds of the linker-generated shared-data section, when it is visible.
pub fn shared_section() -> Option<Range<usize>> {
    let lookup = |name: &CStr| {
        // Safety: RTLD_DEFAULT lookup of a NUL-terminated name.
        let addr = unsafe { libc::dlsym(libc::RTLD_DEFAULT, name.as_ptr()) };
        (!addr.is_null()).then_some(addr as usize)
    };
    let start = lookup(c"__start_mpkgate_shared")?;
    let stop = lookup(c"__stop_mpkgate_shared")?;
    (start < stop).then_some(start..stop)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seg(kind: SegmentKind, start: usize, len: usize, flags: u32) -> Segment {
        Segment {
            kind,
            start,
            len,
            align: PAGE_SIZE,
            flags,
        }
    }

    fn image(segments: Vec<Segment>) -> ModuleImage {
        ModuleImage {
            name: "/usr/lib/libparser.so.2".into(),
            base: 0x10_0000,
            segments,
        }
    }

    fn owner() -> CompartmentId {
        CompartmentId::new(2).unwrap()
    }

    #[test]
    fn read_only_segments_stay_shared() {
        let img = image(vec![seg(SegmentKind::Load, 0x10_0000, 0x1800, PF_R | PF_X)]);
        let regions = plan(&img, owner(), &[]).unwrap();
        assert_eq!(regions.len(), 1);
        assert_eq!(regions[0].class, Classification::SharedRo);
        assert_eq!(regions[0].len, 0x2000);
        assert_eq!(regions[0].key(), 0);
    }

    #[test]
    fn writable_segment_minus_relro_and_shared() {
        let img = image(vec![
            seg(SegmentKind::Load, 0x20_0000, 0x6000, PF_R | PF_W),
            seg(SegmentKind::Relro, 0x20_0000, 0x1000, PF_R),
        ]);
        let shared = [0x20_3000..0x20_3100];
        let regions = plan(&img, owner(), &shared).unwrap();
        let summary: Vec<(usize, usize, Classification)> =
            regions.iter().map(|r| (r.start, r.len, r.class)).collect();
        assert_eq!(
            summary,
            vec![
                (0x20_0000, 0x1000, Classification::SharedRo),
                (0x20_1000, 0x2000, Classification::Private),
                (0x20_3000, 0x1000, Classification::SharedRw),
                (0x20_4000, 0x2000, Classification::Private),
            ]
        );
        assert!(regions.iter().all(|r| r.owner == owner()));
        assert_eq!(regions[1].key(), 2);
    }

    #[test]
    fn unaligned_shared_section_is_rejected() {
        let img = image(vec![seg(SegmentKind::Load, 0x20_0000, 0x2000, PF_R | PF_W)]);
        let err = plan(&img, owner(), &[0x20_0010..0x20_0100]).unwrap_err();
        assert!(matches!(err, ConfigError::UnalignedSharedSection { .. }));
    }

    #[test]
    fn unpadded_tls_is_rejected() {
        let mut tls = seg(SegmentKind::Tls, 0x20_0000, 0x40, PF_R | PF_W);
        tls.align = 8;
        let err = plan(&image(vec![tls]), owner(), &[]).unwrap_err();
        assert!(matches!(err, ConfigError::TlsNotPadded { module } if module == "libparser.so.2"));
    }

    #[test]
    fn subtract_handles_edges() {
        assert_eq!(subtract(0..10, &[]), vec![0..10]);
        assert_eq!(subtract(0..10, &[0..3, 8..12]), vec![3..8]);
        assert_eq!(subtract(0..10, &[2..4, 3..6]), vec![0..2, 6..10]);
        assert!(subtract(0..10, &[0..10]).is_empty());
    }

    #[test]
    fn finds_the_main_executable() {
        let modules = loaded_modules();
        assert!(!modules.is_empty());
        assert!(modules.iter().any(|m| m
            .segments
            .iter()
            .any(|s| s.kind == SegmentKind::Load)));
    }
}
