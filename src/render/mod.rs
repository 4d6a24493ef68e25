//! Renderers turn skeletons into wire formats.

pub mod json;
pub mod xml;

use crate::error::Result;
use crate::skeleton::Skeleton;
use crate::skellist::SkelList;

pub use json::JsonRender;
pub use xml::{serialize_xml, XmlRender};

pub trait Renderer {
    /// A single skeleton: its values, structure and (for JSON) errors.
    fn view(&self, skel: &Skeleton, action: &str) -> Result<String>;
    fn list(&self, skellist: &SkelList, action: &str) -> Result<String>;

    fn add(&self, skel: &Skeleton) -> Result<String> {
        self.view(skel, "add")
    }
    fn edit(&self, skel: &Skeleton) -> Result<String> {
        self.view(skel, "edit")
    }
}
