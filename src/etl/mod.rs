/// ETL Module
///
/// Building blocks of a warehouse load:
/// - Extract: detect which operational rows changed since their checkpoint
/// - Transform: derive segments, price ranges, fact measures and calendar rows
/// - Load: plan slowly changing dimension versions and fact appends
/// - Checkpoint / Jobs: durable cursors and the run log
pub mod checkpoint;
pub mod extract;
pub mod jobs;
pub mod load;
pub mod transform;
