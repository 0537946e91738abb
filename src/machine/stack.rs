use crate::machine::machine_indices::*;
use crate::types::*;

/// An environment: the permanent registers of one clause activation plus
/// its continuation. Slots are 1-indexed like Y registers.
#[derive(Debug)]
pub(crate) struct AndFrame {
    pub(crate) e: usize,
    pub(crate) cp: CodePtr,
    cells: Vec<HeapCellValue>,
}

impl AndFrame {
    #[inline]
    pub(crate) fn num_cells(&self) -> usize {
        self.cells.len()
    }

    #[inline]
    pub(crate) fn cell(&self, index: usize) -> HeapCellValue {
        self.cells[index - 1]
    }

    #[inline]
    pub(crate) fn cell_ref(&self, index: usize) -> &HeapCellValue {
        &self.cells[index - 1]
    }

    #[inline]
    pub(crate) fn cell_mut(&mut self, index: usize) -> &mut HeapCellValue {
        &mut self.cells[index - 1]
    }
}

/// A choice point: everything needed to retry the next alternative.
#[derive(Debug)]
pub(crate) struct OrFrame {
    pub(crate) e: usize,
    pub(crate) cp: CodePtr,
    pub(crate) b: usize,
    pub(crate) bp: CodePtr,
    pub(crate) tr: usize,
    pub(crate) h: usize,
    pub(crate) b0: usize,
    pub(crate) args: Vec<HeapCellValue>,
}

#[derive(Debug)]
pub(crate) enum Frame {
    And(AndFrame),
    Or(OrFrame),
}

/// The local stack. Frames are addressed by index + 1, so 0 means "none"
/// and age comparisons between `e` and `b` are plain integer comparisons.
/// Allocation truncates to `max(e, b)` first, which reclaims the space of
/// deallocated environments exactly as the original machine computed its
/// frame top from the younger of E and B.
#[derive(Debug, Default)]
pub(crate) struct Stack {
    frames: Vec<Frame>,
}

impl Stack {
    pub(crate) fn new() -> Self {
        Stack { frames: vec![] }
    }

    pub(crate) fn allocate_and_frame(
        &mut self,
        num_cells: usize,
        e: usize,
        cp: CodePtr,
        b: usize,
    ) -> usize {
        self.frames.truncate(e.max(b));

        let frame_index = self.frames.len() + 1;
        let cells = (1..=num_cells)
            .map(|sc| HeapCellValue::StackVar(frame_index, sc))
            .collect();

        self.frames.push(Frame::And(AndFrame { e, cp, cells }));
        frame_index
    }

    #[allow(clippy::too_many_arguments)]
    pub(crate) fn allocate_or_frame(
        &mut self,
        e: usize,
        cp: CodePtr,
        b: usize,
        bp: CodePtr,
        tr: usize,
        h: usize,
        b0: usize,
        args: Vec<HeapCellValue>,
    ) -> usize {
        self.frames.truncate(self.top(e, b));

        self.frames.push(Frame::Or(OrFrame {
            e,
            cp,
            b,
            bp,
            tr,
            h,
            b0,
            args,
        }));

        self.frames.len()
    }

    // the frame top is the younger of e and b, but e protects its own
    // frame even when older frames were deallocated above b.
    fn top(&self, e: usize, b: usize) -> usize {
        e.max(b)
    }

    #[inline]
    pub(crate) fn index_and_frame(&self, e: usize) -> &AndFrame {
        match &self.frames[e - 1] {
            Frame::And(frame) => frame,
            Frame::Or(_) => unreachable!("e register addresses an or-frame"),
        }
    }

    #[inline]
    pub(crate) fn index_and_frame_mut(&mut self, e: usize) -> &mut AndFrame {
        match &mut self.frames[e - 1] {
            Frame::And(frame) => frame,
            Frame::Or(_) => unreachable!("e register addresses an or-frame"),
        }
    }

    #[inline]
    pub(crate) fn index_or_frame(&self, b: usize) -> &OrFrame {
        match &self.frames[b - 1] {
            Frame::Or(frame) => frame,
            Frame::And(_) => unreachable!("b register addresses an and-frame"),
        }
    }

    #[inline]
    pub(crate) fn index_or_frame_mut(&mut self, b: usize) -> &mut OrFrame {
        match &mut self.frames[b - 1] {
            Frame::Or(frame) => frame,
            Frame::And(_) => unreachable!("b register addresses an and-frame"),
        }
    }

    #[inline]
    pub(crate) fn truncate(&mut self, b: usize) {
        self.frames.truncate(b);
    }

    #[inline]
    pub(crate) fn len(&self) -> usize {
        self.frames.len()
    }

    pub(crate) fn clear(&mut self) {
        self.frames.clear();
    }
}
