//! Type- and rank-erased byte views over caller-owned field storage.
//!
//! A [`FieldView`] presents any field as a sequence of fixed-size byte
//! elements. Arrays of higher rank are erased by peeling their outer
//! dimensions one at a time until a two-dimensional `[element, byte]` view
//! remains, so a row-major `[a, b, n]` array of `f64` becomes `a × b` views of
//! `n` elements, 8 bytes each. Views never allocate or free the storage they
//! cover.

use bytemuck::Pod;
use std::fmt;
use std::mem::size_of;
use std::ops::Range;

use crate::exchange_error::ExchangeError;

enum Storage<'a> {
    Shared(&'a [u8]),
    Exclusive(&'a mut [u8]),
}

impl Storage<'_> {
    fn bytes(&self) -> &[u8] {
        match self {
            Storage::Shared(b) => b,
            Storage::Exclusive(b) => b,
        }
    }
}

/// Copyable description of a view, as consumed by the transfer planner.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct FieldLayout {
    /// Element count.
    pub len: usize,
    /// Bytes per element.
    pub elem_size: usize,
    /// Rank authoritative for the field's canonical (global) copy.
    pub owner: usize,
}

/// `[element, byte]` view over one contiguous run of field storage.
pub struct FieldView<'a> {
    data: Storage<'a>,
    elem_size: usize,
    owner: usize,
}

impl<'a> FieldView<'a> {
    fn checked(data: Storage<'a>, elem_size: usize, owner: usize) -> Result<Self, ExchangeError> {
        let n = data.bytes().len();
        if elem_size == 0 || n % elem_size != 0 {
            return Err(ExchangeError::InvalidShape(format!(
                "{n} bytes cannot be split into elements of {elem_size} bytes"
            )));
        }
        Ok(Self {
            data,
            elem_size,
            owner,
        })
    }

    /// Read-only view over raw bytes holding `bytes.len() / elem_size` elements.
    pub fn from_bytes(bytes: &'a [u8], elem_size: usize, owner: usize) -> Result<Self, ExchangeError> {
        Self::checked(Storage::Shared(bytes), elem_size, owner)
    }

    /// Writable view over raw bytes holding `bytes.len() / elem_size` elements.
    pub fn from_bytes_mut(
        bytes: &'a mut [u8],
        elem_size: usize,
        owner: usize,
    ) -> Result<Self, ExchangeError> {
        Self::checked(Storage::Exclusive(bytes), elem_size, owner)
    }

    /// Read-only rank-1 view, one element per `T`.
    pub fn from_slice<T: Pod>(data: &'a [T], owner: usize) -> Self {
        Self {
            data: Storage::Shared(bytemuck::cast_slice(data)),
            elem_size: size_of::<T>(),
            owner,
        }
    }

    /// Writable rank-1 view, one element per `T`.
    pub fn from_slice_mut<T: Pod>(data: &'a mut [T], owner: usize) -> Self {
        Self {
            data: Storage::Exclusive(bytemuck::cast_slice_mut(data)),
            elem_size: size_of::<T>(),
            owner,
        }
    }

    /// Empty writable view, for global-side descriptors on ranks that do not
    /// own the field and therefore receive nothing into it.
    pub fn placeholder(elem_size: usize, owner: usize) -> Self {
        Self {
            data: Storage::Exclusive(&mut []),
            elem_size,
            owner,
        }
    }

    /// Element count.
    pub fn len(&self) -> usize {
        self.data.bytes().len().checked_div(self.elem_size).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Bytes per element.
    pub fn elem_size(&self) -> usize {
        self.elem_size
    }

    pub fn owner(&self) -> usize {
        self.owner
    }

    pub fn set_owner(&mut self, owner: usize) {
        self.owner = owner;
    }

    pub fn is_writable(&self) -> bool {
        matches!(self.data, Storage::Exclusive(_))
    }

    pub fn layout(&self) -> FieldLayout {
        FieldLayout {
            len: self.len(),
            elem_size: self.elem_size,
            owner: self.owner,
        }
    }

    /// Byte range of element `i`; `None` if it cannot be addressed.
    fn element_range(&self, i: usize) -> Option<Range<usize>> {
        let start = i.checked_mul(self.elem_size)?;
        Some(start..start.checked_add(self.elem_size)?)
    }

    /// Bytes of element `i`.
    pub fn read(&self, i: usize) -> Option<&[u8]> {
        self.data.bytes().get(self.element_range(i)?)
    }

    /// Mutable bytes of element `i`; `None` when out of range or read-only.
    pub fn write(&mut self, i: usize) -> Option<&mut [u8]> {
        let range = self.element_range(i)?;
        self.as_bytes_mut()?.get_mut(range)
    }

    /// Restrict the view to its first `len` elements.
    ///
    /// # Errors
    /// [`ExchangeError::InvalidShape`] if `len` exceeds the view length.
    pub fn prefix(self, len: usize) -> Result<Self, ExchangeError> {
        let available = self.len();
        if len > available {
            return Err(ExchangeError::InvalidShape(format!(
                "prefix of {len} elements from a view of {available}"
            )));
        }
        let end = len * self.elem_size;
        let data = match self.data {
            Storage::Shared(b) => Storage::Shared(&b[..end]),
            Storage::Exclusive(b) => Storage::Exclusive(&mut b[..end]),
        };
        Ok(Self {
            data,
            elem_size: self.elem_size,
            owner: self.owner,
        })
    }

    /// All elements, back to back.
    pub fn as_bytes(&self) -> &[u8] {
        self.data.bytes()
    }

    /// All elements, back to back; `None` for read-only views.
    pub fn as_bytes_mut(&mut self) -> Option<&mut [u8]> {
        match &mut self.data {
            Storage::Shared(_) => None,
            Storage::Exclusive(b) => Some(&mut **b),
        }
    }
}

impl fmt::Debug for FieldView<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FieldView")
            .field("len", &self.len())
            .field("elem_size", &self.elem_size)
            .field("owner", &self.owner)
            .field("writable", &self.is_writable())
            .finish()
    }
}

fn check_shape<T>(len: usize, shape: &[usize]) -> Result<(), ExchangeError> {
    if size_of::<T>() == 0 {
        return Err(ExchangeError::InvalidShape("zero-sized element type".into()));
    }
    if shape.is_empty() {
        return Err(ExchangeError::InvalidShape("rank must be at least 1".into()));
    }
    let total = shape
        .iter()
        .try_fold(1usize, |acc, &d| acc.checked_mul(d))
        .ok_or_else(|| ExchangeError::InvalidShape(format!("shape {shape:?} overflows")))?;
    if total != len {
        return Err(ExchangeError::InvalidShape(format!(
            "shape {shape:?} describes {total} values, storage holds {len}"
        )));
    }
    Ok(())
}

fn peel<'a>(
    bytes: &'a [u8],
    shape: &[usize],
    elem_size: usize,
    owner: usize,
    out: &mut Vec<FieldView<'a>>,
) {
    match shape {
        [] => {}
        [_] => out.push(FieldView {
            data: Storage::Shared(bytes),
            elem_size,
            owner,
        }),
        [outer, inner @ ..] => {
            let stride = inner.iter().product::<usize>() * elem_size;
            if stride == 0 {
                (0..*outer).for_each(|_| peel(&[], inner, elem_size, owner, out));
            } else {
                for chunk in bytes.chunks_exact(stride) {
                    peel(chunk, inner, elem_size, owner, out);
                }
            }
        }
    }
}

fn peel_mut<'a>(
    bytes: &'a mut [u8],
    shape: &[usize],
    elem_size: usize,
    owner: usize,
    out: &mut Vec<FieldView<'a>>,
) {
    match shape {
        [] => {}
        [_] => out.push(FieldView {
            data: Storage::Exclusive(bytes),
            elem_size,
            owner,
        }),
        [outer, inner @ ..] => {
            let stride = inner.iter().product::<usize>() * elem_size;
            if stride == 0 {
                (0..*outer).for_each(|_| peel_mut(&mut [], inner, elem_size, owner, out));
            } else {
                for chunk in bytes.chunks_exact_mut(stride) {
                    peel_mut(chunk, inner, elem_size, owner, out);
                }
            }
        }
    }
}

/// Erase a row-major array of any rank into writable `[element, byte]` views.
///
/// Views come out in row-major order of the outer indices; each holds
/// `shape[shape.len() - 1]` elements of `size_of::<T>()` bytes.
///
/// # Errors
/// [`ExchangeError::InvalidShape`] if `shape` is empty or does not describe `data`.
pub fn field_views<'a, T: Pod>(
    data: &'a mut [T],
    shape: &[usize],
    owner: usize,
) -> Result<Vec<FieldView<'a>>, ExchangeError> {
    check_shape::<T>(data.len(), shape)?;
    let mut out = Vec::with_capacity(shape[..shape.len() - 1].iter().product());
    peel_mut(bytemuck::cast_slice_mut(data), shape, size_of::<T>(), owner, &mut out);
    Ok(out)
}

/// Read-only counterpart of [`field_views`].
pub fn field_views_ref<'a, T: Pod>(
    data: &'a [T],
    shape: &[usize],
    owner: usize,
) -> Result<Vec<FieldView<'a>>, ExchangeError> {
    check_shape::<T>(data.len(), shape)?;
    let mut out = Vec::with_capacity(shape[..shape.len() - 1].iter().product());
    peel(bytemuck::cast_slice(data), shape, size_of::<T>(), owner, &mut out);
    Ok(out)
}

fn check_prefix(shape: &[usize], len: usize) -> Result<(), ExchangeError> {
    match shape.last() {
        Some(&last) if len > last => Err(ExchangeError::InvalidShape(format!(
            "prefix of {len} elements exceeds the innermost extent of shape {shape:?}"
        ))),
        _ => Ok(()),
    }
}

/// Like [`field_views`], but each view covers only the first `len` elements
/// of its row. Used to transfer the owned part of a halo-padded array, whose
/// trailing ghost entries stay untouched.
///
/// # Errors
/// [`ExchangeError::InvalidShape`] if `shape` does not describe `data` or
/// `len` exceeds the innermost extent.
pub fn field_views_prefix<'a, T: Pod>(
    data: &'a mut [T],
    shape: &[usize],
    len: usize,
    owner: usize,
) -> Result<Vec<FieldView<'a>>, ExchangeError> {
    check_shape::<T>(data.len(), shape)?;
    check_prefix(shape, len)?;
    field_views(data, shape, owner)?
        .into_iter()
        .map(|v| v.prefix(len))
        .collect()
}

/// Read-only counterpart of [`field_views_prefix`].
pub fn field_views_prefix_ref<'a, T: Pod>(
    data: &'a [T],
    shape: &[usize],
    len: usize,
    owner: usize,
) -> Result<Vec<FieldView<'a>>, ExchangeError> {
    check_shape::<T>(data.len(), shape)?;
    check_prefix(shape, len)?;
    field_views_ref(data, shape, owner)?
        .into_iter()
        .map(|v| v.prefix(len))
        .collect()
}

/// Field storage that can present itself as a list of [`FieldView`]s.
pub trait AsFieldViews {
    fn field_views(&self, owner: usize) -> Result<Vec<FieldView<'_>>, ExchangeError>;
    fn field_views_mut(&mut self, owner: usize) -> Result<Vec<FieldView<'_>>, ExchangeError>;
}

impl<T: Pod> AsFieldViews for [T] {
    fn field_views(&self, owner: usize) -> Result<Vec<FieldView<'_>>, ExchangeError> {
        Ok(vec![FieldView::from_slice(self, owner)])
    }

    fn field_views_mut(&mut self, owner: usize) -> Result<Vec<FieldView<'_>>, ExchangeError> {
        Ok(vec![FieldView::from_slice_mut(self, owner)])
    }
}

impl<T: Pod> AsFieldViews for Vec<T> {
    fn field_views(&self, owner: usize) -> Result<Vec<FieldView<'_>>, ExchangeError> {
        self.as_slice().field_views(owner)
    }

    fn field_views_mut(&mut self, owner: usize) -> Result<Vec<FieldView<'_>>, ExchangeError> {
        self.as_mut_slice().field_views_mut(owner)
    }
}

/// Owned row-major array of any rank.
#[derive(Clone, Debug, PartialEq)]
pub struct ArrayField<T> {
    data: Vec<T>,
    shape: Vec<usize>,
}

impl<T: Pod> ArrayField<T> {
    pub fn new(data: Vec<T>, shape: Vec<usize>) -> Result<Self, ExchangeError> {
        check_shape::<T>(data.len(), &shape)?;
        Ok(Self { data, shape })
    }

    /// Zero-filled array of the given shape.
    pub fn zeroed(shape: Vec<usize>) -> Result<Self, ExchangeError> {
        let len = shape.iter().try_fold(1usize, |acc, &d| acc.checked_mul(d));
        let len = len.ok_or_else(|| ExchangeError::InvalidShape(format!("shape {shape:?} overflows")))?;
        Self::new(vec![T::zeroed(); len], shape)
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn data(&self) -> &[T] {
        &self.data
    }

    pub fn into_data(self) -> Vec<T> {
        self.data
    }
}

impl<T: Pod> AsFieldViews for ArrayField<T> {
    fn field_views(&self, owner: usize) -> Result<Vec<FieldView<'_>>, ExchangeError> {
        field_views_ref(&self.data, &self.shape, owner)
    }

    fn field_views_mut(&mut self, owner: usize) -> Result<Vec<FieldView<'_>>, ExchangeError> {
        field_views(&mut self.data, &self.shape, owner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rank_one_slice_view() {
        let data = [1.5f64, -2.0, 3.25];
        let v = FieldView::from_slice(&data, 2);
        assert_eq!((v.len(), v.elem_size(), v.owner()), (3, 8, 2));
        assert_eq!(v.read(1), Some(&(-2.0f64).to_ne_bytes()[..]));
        assert_eq!(v.read(3), None);
    }

    #[test]
    fn huge_element_index_is_out_of_range() {
        let mut data = [11u64, 22, 33];
        let v = FieldView::from_slice(&data, 0);
        assert_eq!(v.read(usize::MAX / 8 + 1), None);
        assert_eq!(v.read(usize::MAX), None);
        let mut v = FieldView::from_slice_mut(&mut data, 0);
        assert!(v.write(usize::MAX / 8 + 1).is_none());
        assert!(v.write(usize::MAX).is_none());
    }

    #[test]
    fn rank_three_peels_outer_dimensions() {
        // shape [2, 3, 4] of i32: 6 views of 4 elements each
        let mut data: Vec<i32> = (0..24).collect();
        let views = field_views(&mut data, &[2, 3, 4], 1).unwrap();
        assert_eq!(views.len(), 6);
        for (k, v) in views.iter().enumerate() {
            assert_eq!(v.len(), 4);
            assert_eq!(v.elem_size(), 4);
            let first = i32::from_ne_bytes(v.read(0).unwrap().try_into().unwrap());
            assert_eq!(first, 4 * k as i32);
        }
    }

    #[test]
    fn rank_nine_is_supported() {
        let shape = [2, 1, 2, 1, 1, 2, 1, 1, 3];
        let data = vec![0u8; 24];
        let views = field_views_ref(&data, &shape, 0).unwrap();
        assert_eq!(views.len(), 8);
        assert!(views.iter().all(|v| v.len() == 3 && !v.is_writable()));
    }

    #[test]
    fn writes_land_in_storage() {
        let mut data = vec![0i64; 6];
        {
            let mut views = field_views(&mut data, &[2, 3], 0).unwrap();
            views[1].write(2).unwrap().copy_from_slice(&7i64.to_ne_bytes());
        }
        assert_eq!(data, vec![0, 0, 0, 0, 0, 7]);
    }

    #[test]
    fn zero_extent_dimensions() {
        let mut data: Vec<f32> = Vec::new();
        let views = field_views(&mut data, &[3, 0], 0).unwrap();
        assert_eq!(views.len(), 3);
        assert!(views.iter().all(FieldView::is_empty));
        assert!(field_views(&mut data, &[0, 5], 0).unwrap().is_empty());
    }

    #[test]
    fn bad_shapes_rejected() {
        let mut data = vec![0f64; 6];
        assert!(matches!(
            field_views(&mut data, &[4, 2], 0),
            Err(ExchangeError::InvalidShape(_))
        ));
        assert!(matches!(
            field_views(&mut data, &[], 0),
            Err(ExchangeError::InvalidShape(_))
        ));
        assert!(FieldView::from_bytes(&[0u8; 5], 2, 0).is_err());
    }

    #[test]
    fn prefix_views_skip_trailing_ghosts() {
        // two levels of 3 owned + 2 ghost entries
        let mut data: Vec<u16> = (0..10).collect();
        {
            let mut views = field_views_prefix(&mut data, &[2, 5], 3, 1).unwrap();
            assert!(views.iter().all(|v| v.len() == 3 && v.owner() == 1));
            assert!(views[1].write(3).is_none());
            views[1].write(2).unwrap().copy_from_slice(&99u16.to_ne_bytes());
        }
        assert_eq!(data[7], 99);
        let views = field_views_prefix_ref(&data, &[2, 5], 0, 0).unwrap();
        assert!(views.iter().all(FieldView::is_empty));
        assert!(matches!(
            field_views_prefix_ref(&data, &[2, 5], 6, 0),
            Err(ExchangeError::InvalidShape(_))
        ));
        assert!(FieldView::from_slice(&data, 0).prefix(11).is_err());
    }

    #[test]
    fn shared_views_refuse_writes() {
        let data = [1u32, 2];
        let mut v = FieldView::from_slice(&data, 0);
        assert!(v.write(0).is_none());
        assert!(v.as_bytes_mut().is_none());
        v.set_owner(3);
        assert_eq!(v.layout().owner, 3);
    }

    #[test]
    fn array_field_provides_views() {
        let mut arr = ArrayField::<f32>::zeroed(vec![2, 5]).unwrap();
        let views = arr.field_views_mut(1).unwrap();
        assert_eq!(views.len(), 2);
        assert_eq!(
            views[0].layout(),
            FieldLayout {
                len: 5,
                elem_size: 4,
                owner: 1
            }
        );
    }
}
