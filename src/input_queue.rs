//! Per-player input queue with repeat-last prediction.
//!
//! Each player owns one `InputQueue`: a circular array of frame-stamped
//! controller records. Local inputs enter at `frame + frame_delay`; remote
//! inputs enter at the frame their sender stamped. Requesting a frame that
//! has no authoritative record yields a prediction - the last known input,
//! held constant - and the queue remembers the first frame at which an
//! authoritative arrival later contradicted that prediction.

use crate::input::{InputRecord, BLANK_RECORD};
use crate::{Frame, InputStatus};

/// The number of inputs a queue can hold per player.
pub const INPUT_QUEUE_LENGTH: usize = 128;

/// One frame-stamped controller record.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct FrameInput {
    /// The frame this record belongs to. [`Frame::NULL`] marks an empty slot.
    pub frame: Frame,
    /// The encoded controller record.
    pub record: InputRecord,
}

impl FrameInput {
    /// Creates a new frame-stamped record.
    #[must_use]
    pub fn new(frame: Frame, record: InputRecord) -> Self {
        Self { frame, record }
    }

    /// A blank (all-zero) record for the given frame.
    #[must_use]
    pub fn blank(frame: Frame) -> Self {
        Self {
            frame,
            record: BLANK_RECORD,
        }
    }
}

/// Circular input queue for a single player.
#[derive(Debug, Clone)]
pub struct InputQueue {
    /// The head of the queue. The newest input is saved here.
    head: usize,
    /// The tail of the queue. The oldest still-valid input is saved here.
    tail: usize,
    /// The current length of the queue.
    length: usize,
    /// Whether we are still waiting for the very first input.
    first_frame: bool,

    /// The last frame added to the queue.
    last_added_frame: Frame,
    /// The first frame known to have been predicted incorrectly.
    first_incorrect_frame: Frame,
    /// The last frame that was requested; nothing at or after it may be
    /// discarded.
    last_requested_frame: Frame,

    /// Frames of delay applied to inputs entering this queue.
    frame_delay: usize,

    inputs: Vec<FrameInput>,
    /// The active prediction, if any.
    prediction: FrameInput,
}

impl Default for InputQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl InputQueue {
    /// Creates an empty queue with no frame delay.
    #[must_use]
    pub fn new() -> Self {
        Self {
            head: 0,
            tail: 0,
            length: 0,
            frame_delay: 0,
            first_frame: true,
            last_added_frame: Frame::NULL,
            first_incorrect_frame: Frame::NULL,
            last_requested_frame: Frame::NULL,
            prediction: FrameInput::blank(Frame::NULL),
            inputs: vec![FrameInput::blank(Frame::NULL); INPUT_QUEUE_LENGTH],
        }
    }

    /// The first frame whose prediction was contradicted by an authoritative
    /// arrival, or [`Frame::NULL`] if all predictions so far were correct.
    #[must_use]
    pub fn first_incorrect_frame(&self) -> Frame {
        self.first_incorrect_frame
    }

    /// The highest frame for which this queue holds an authoritative input.
    /// This is the player's confirmation frontier; it never decreases.
    #[must_use]
    pub fn last_confirmed_frame(&self) -> Frame {
        self.last_added_frame
    }

    /// Sets the delay applied to inputs entering this queue.
    pub fn set_frame_delay(&mut self, delay: usize) {
        self.frame_delay = delay;
    }

    /// Returns the authoritative record stored for `frame`, if the queue
    /// holds one. Never returns a prediction.
    #[must_use]
    pub fn confirmed_record(&self, frame: Frame) -> Option<InputRecord> {
        let offset = frame.buffer_index(INPUT_QUEUE_LENGTH)?;
        if self.inputs[offset].frame == frame {
            Some(self.inputs[offset].record)
        } else {
            None
        }
    }

    /// Leaves prediction mode after a rollback has repaired history.
    pub fn reset_prediction(&mut self) {
        self.prediction.frame = Frame::NULL;
        self.first_incorrect_frame = Frame::NULL;
        self.last_requested_frame = Frame::NULL;
    }

    /// Discards confirmed frames up to `frame`; they are synchronized on
    /// every peer and no longer needed.
    pub fn discard_confirmed_frames(&mut self, mut frame: Frame) {
        if !self.last_requested_frame.is_null() {
            frame = std::cmp::min(frame, self.last_requested_frame);
        }

        if frame >= self.last_added_frame {
            // keep only the most recent input
            self.tail = self.head;
            self.length = 1;
        } else if frame <= self.inputs[self.tail].frame {
            // nothing to discard
        } else {
            let offset = (frame - self.inputs[self.tail].frame) as usize;
            self.tail = (self.tail + offset) % INPUT_QUEUE_LENGTH;
            self.length -= offset;
        }
    }

    /// Returns the input for `requested_frame`, or a prediction if no
    /// authoritative input exists yet.
    ///
    /// The prediction is the most recently added input, held constant. A
    /// request while a mis-prediction is pending keeps returning the stale
    /// prediction; the frame it feeds is re-simulated by the rollback that
    /// repairs the queue on the next frame advance.
    pub fn input(&mut self, requested_frame: Frame) -> (InputRecord, InputStatus) {
        self.last_requested_frame = requested_frame;
        assert!(requested_frame >= self.inputs[self.tail].frame);

        if self.prediction.frame.is_null() {
            // If the requested frame is in our range, return it from the queue.
            let mut offset = (requested_frame - self.inputs[self.tail].frame) as usize;
            if offset < self.length {
                offset = (offset + self.tail) % INPUT_QUEUE_LENGTH;
                assert!(self.inputs[offset].frame == requested_frame);
                return (self.inputs[offset].record, InputStatus::Confirmed);
            }

            // Not in the queue: enter prediction mode, repeating the last
            // known input (or blank if there has never been one).
            if requested_frame == Frame::new(0) || self.last_added_frame.is_null() {
                self.prediction = FrameInput::blank(self.prediction.frame);
            } else {
                let previous = self.previous_head();
                self.prediction = self.inputs[previous];
            }
            self.prediction.frame += 1;
        }

        assert!(!self.prediction.frame.is_null());
        (self.prediction.record, InputStatus::Predicted)
    }

    /// Adds an input to the queue, applying the configured frame delay.
    ///
    /// Returns the frame the input was actually stored at, or [`Frame::NULL`]
    /// if the input was dropped for arriving out of sequence.
    pub fn add_input(&mut self, input: FrameInput) -> Frame {
        // Inputs must be handed in sequentially, regardless of frame delay.
        if !self.last_added_frame.is_null()
            && input.frame + self.frame_delay as i32 != self.last_added_frame + 1
        {
            return Frame::NULL;
        }

        let new_frame = self.advance_queue_head(input.frame);
        if !new_frame.is_null() {
            self.add_input_by_frame(input, new_frame);
        }
        new_frame
    }

    /// Stores an input at `frame_number` and checks it against any pending
    /// prediction for the same frame.
    fn add_input_by_frame(&mut self, input: FrameInput, frame_number: Frame) {
        let previous = self.previous_head();

        assert!(self.last_added_frame.is_null() || frame_number == self.last_added_frame + 1);
        assert!(frame_number == Frame::new(0) || self.inputs[previous].frame == frame_number - 1);

        self.inputs[self.head] = input;
        self.inputs[self.head].frame = frame_number;
        self.head = (self.head + 1) % INPUT_QUEUE_LENGTH;
        self.length += 1;
        assert!(self.length <= INPUT_QUEUE_LENGTH);
        self.first_frame = false;
        self.last_added_frame = frame_number;

        if !self.prediction.frame.is_null() {
            assert!(frame_number == self.prediction.frame);

            // Remember the first mis-predicted frame so a rollback can
            // repair from there.
            if self.first_incorrect_frame.is_null() && self.prediction.record != input.record {
                self.first_incorrect_frame = frame_number;
            }

            // If the prediction has caught up with the last requested frame
            // and nothing was wrong, leave prediction mode.
            if self.prediction.frame == self.last_requested_frame
                && self.first_incorrect_frame.is_null()
            {
                self.prediction.frame = Frame::NULL;
            } else {
                self.prediction.frame += 1;
            }
        }
    }

    /// Moves the queue head to where `input_frame` lands after frame delay,
    /// replicating or dropping inputs if the delay changed between frames.
    fn advance_queue_head(&mut self, mut input_frame: Frame) -> Frame {
        let previous = self.previous_head();

        let mut expected_frame = if self.first_frame {
            Frame::new(0)
        } else {
            self.inputs[previous].frame + 1
        };

        input_frame += self.frame_delay as i32;
        if expected_frame > input_frame {
            // Frame delay shrank since the last input; no room, drop it.
            return Frame::NULL;
        }

        // Frame delay grew since the last input; replicate the last input to
        // fill the gap.
        while expected_frame < input_frame {
            let replicated = self.inputs[self.previous_head()];
            self.add_input_by_frame(replicated, expected_frame);
            expected_frame += 1;
        }

        let previous = self.previous_head();
        assert!(input_frame == Frame::new(0) || input_frame == self.inputs[previous].frame + 1);
        input_frame
    }

    fn previous_head(&self) -> usize {
        match self.head {
            0 => INPUT_QUEUE_LENGTH - 1,
            _ => self.head - 1,
        }
    }
}

// #########
// # TESTS #
// #########

#[cfg(test)]
mod input_queue_tests {
    use super::*;

    fn record(value: u8) -> InputRecord {
        let mut record = BLANK_RECORD;
        record[0] = value;
        record
    }

    #[test]
    fn test_add_input_out_of_sequence_is_dropped() {
        let mut queue = InputQueue::new();
        assert_eq!(
            queue.add_input(FrameInput::new(Frame::new(0), record(0))),
            Frame::new(0)
        );
        assert_eq!(
            queue.add_input(FrameInput::new(Frame::new(3), record(0))),
            Frame::NULL
        );
    }

    #[test]
    fn test_add_input_twice_is_dropped() {
        let mut queue = InputQueue::new();
        let input = FrameInput::new(Frame::new(0), record(0));
        assert_eq!(queue.add_input(input), Frame::new(0));
        assert_eq!(queue.add_input(input), Frame::NULL);
    }

    #[test]
    fn test_sequential_inputs_are_confirmed() {
        let mut queue = InputQueue::new();
        for i in 0..10i32 {
            queue.add_input(FrameInput::new(Frame::new(i), record(i as u8)));
            assert_eq!(queue.last_confirmed_frame(), Frame::new(i));

            let (bytes, status) = queue.input(Frame::new(i));
            assert_eq!(status, InputStatus::Confirmed);
            assert_eq!(bytes[0], i as u8);
        }
    }

    #[test]
    fn test_frame_delay_shifts_storage_frame() {
        let mut queue = InputQueue::new();
        let delay = 2;
        queue.set_frame_delay(delay);
        for i in 0..10i32 {
            let stored = queue.add_input(FrameInput::new(Frame::new(i), record(i as u8)));
            assert_eq!(stored, Frame::new(i + delay as i32));
        }
    }

    #[test]
    fn test_prediction_repeats_last_confirmed() {
        let mut queue = InputQueue::new();
        queue.add_input(FrameInput::new(Frame::new(0), record(9)));

        let (bytes, status) = queue.input(Frame::new(3));
        assert_eq!(status, InputStatus::Predicted);
        assert_eq!(bytes[0], 9);
    }

    #[test]
    fn test_prediction_with_no_history_is_blank() {
        let mut queue = InputQueue::new();
        let (bytes, status) = queue.input(Frame::new(0));
        assert_eq!(status, InputStatus::Predicted);
        assert_eq!(bytes, BLANK_RECORD);
    }

    #[test]
    fn test_correct_prediction_is_not_flagged() {
        let mut queue = InputQueue::new();
        queue.add_input(FrameInput::new(Frame::new(0), record(4)));

        // predict frame 1, then the real input arrives and matches
        let (bytes, _) = queue.input(Frame::new(1));
        assert_eq!(bytes[0], 4);
        queue.add_input(FrameInput::new(Frame::new(1), record(4)));
        assert!(queue.first_incorrect_frame().is_null());
    }

    #[test]
    fn test_mis_prediction_records_first_incorrect_frame() {
        let mut queue = InputQueue::new();
        queue.add_input(FrameInput::new(Frame::new(0), record(4)));

        let _ = queue.input(Frame::new(1));
        let _ = queue.input(Frame::new(2));
        queue.add_input(FrameInput::new(Frame::new(1), record(5)));
        assert_eq!(queue.first_incorrect_frame(), Frame::new(1));

        // repairing leaves prediction mode
        queue.reset_prediction();
        assert!(queue.first_incorrect_frame().is_null());
    }

    #[test]
    fn test_discard_confirmed_frames_keeps_requested() {
        let mut queue = InputQueue::new();
        for i in 0..20i32 {
            queue.add_input(FrameInput::new(Frame::new(i), record(i as u8)));
        }
        let _ = queue.input(Frame::new(10));
        queue.discard_confirmed_frames(Frame::new(15));

        // frame 10 was the last requested, so it must survive
        let (bytes, status) = queue.input(Frame::new(10));
        assert_eq!(status, InputStatus::Confirmed);
        assert_eq!(bytes[0], 10);
    }

    #[test]
    fn test_frontier_is_monotonic() {
        let mut queue = InputQueue::new();
        let mut last = Frame::NULL;
        for i in 0..50i32 {
            queue.add_input(FrameInput::new(Frame::new(i), record(0)));
            assert!(queue.last_confirmed_frame() >= last);
            last = queue.last_confirmed_frame();
        }
    }
}
