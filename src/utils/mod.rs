pub mod resource_quantity;
