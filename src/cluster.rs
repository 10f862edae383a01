//! Block clustering for one day of timeline items.
//!
//! State machine:
//! - message: extends the running dialog, or closes a log cluster and starts one
//! - log: extends the running log cluster, or closes a dialog and starts one
//! - note: closes whatever is open and emits a singleton note block
//!
//! Dialogs have no size or time-gap limit; only a log or note breaks them.
//! Concatenating the emitted blocks reproduces the input order exactly.

use crate::participants::ParticipantDirectory;
use crate::records::{
    Block, DialogBlock, ItemKind, ItemType, LogClusterBlock, MessageType, NoteBlock,
    TimelineItem,
};

enum Building {
    Nothing,
    Dialog(DialogBlock),
    LogCluster(Vec<TimelineItem>),
}

pub struct Clusterer<'a> {
    directory: &'a ParticipantDirectory,
    blocks: Vec<Block>,
    building: Building,
}

impl<'a> Clusterer<'a> {
    pub fn new(directory: &'a ParticipantDirectory) -> Self {
        Self {
            directory,
            blocks: Vec::new(),
            building: Building::Nothing,
        }
    }

    pub fn push(&mut self, mut item: TimelineItem) {
        match item.item_type() {
            ItemType::Message => {
                if let ItemKind::Message(message) = &item.kind {
                    if message.mtype == MessageType::Call {
                        item.call = Some(self.directory.resolve_call(message));
                    }
                }
                if let Building::Dialog(dialog) = &mut self.building {
                    dialog.items.push(item);
                } else {
                    self.flush();
                    self.building = Building::Dialog(DialogBlock {
                        start_time: item.sort_time,
                        items: vec![item],
                    });
                }
            }
            ItemType::Log => {
                if let Building::LogCluster(logs) = &mut self.building {
                    logs.push(item);
                } else {
                    self.flush();
                    self.building = Building::LogCluster(vec![item]);
                }
            }
            ItemType::Note => {
                self.flush();
                self.blocks.push(Block::Note(NoteBlock { note: item }));
            }
        }
    }

    /// Emit the block under construction, if any.
    fn flush(&mut self) {
        match std::mem::replace(&mut self.building, Building::Nothing) {
            Building::Nothing => {}
            Building::Dialog(dialog) => self.blocks.push(Block::Dialog(dialog)),
            Building::LogCluster(logs) => {
                self.blocks.push(Block::LogCluster(LogClusterBlock { logs }))
            }
        }
    }

    pub fn finish(mut self) -> Vec<Block> {
        self.flush();
        self.blocks
    }
}

pub fn cluster_day(items: Vec<TimelineItem>, directory: &ParticipantDirectory) -> Vec<Block> {
    let mut clusterer = Clusterer::new(directory);
    for item in items {
        clusterer.push(item);
    }
    clusterer.finish()
}
