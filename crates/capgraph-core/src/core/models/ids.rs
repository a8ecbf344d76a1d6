use slotmap::new_key_type;

new_key_type! {
    pub struct FunctorId;
    pub struct BackendFnId;
}
