//! Common re-exports for convenient entity usage.

pub use super::comment::{
    ActiveModel as CommentActiveModel, Column as CommentColumn, Entity as Comment,
    Model as CommentModel,
};
